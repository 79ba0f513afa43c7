//! The namespace of the active kubectl context.
//!
//! Driver scripts call `kubectl` without `--namespace`, so the harness points
//! the active context at the test namespace while a script runs and restores
//! the previous namespace afterwards. The context lives in the kubeconfig and
//! is shared by everything on the machine, which is why every swap in this
//! process goes through one lock.
use std::future::Future;

use async_trait::async_trait;
use lazy_static::lazy_static;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ScriptError;

lazy_static! {
    static ref CONTEXT_LOCK: Mutex<()> = Mutex::new(());
}

/// Reads and changes the namespace of the active cluster context.
#[async_trait]
pub trait NamespaceContext: Send + Sync {
    /// The namespace set on the active context, `None` when it has none.
    async fn current_namespace(&self) -> Result<Option<String>, ScriptError>;

    async fn set_namespace(&self, namespace: &str) -> Result<(), ScriptError>;

    /// Removes the namespace from the active context.
    async fn clear_namespace(&self) -> Result<(), ScriptError>;
}

/// [`NamespaceContext`] backed by `kubectl` from the `PATH`.
#[derive(Clone, Debug, Default)]
pub struct KubectlContext;

impl KubectlContext {
    async fn kubectl(&self, args: &[&str]) -> Result<String, ScriptError> {
        let command = format!("kubectl {}", args.join(" "));
        let output = Command::new("kubectl")
            .args(args)
            .output()
            .await
            .map_err(|source| ScriptError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ScriptError::Kubectl {
                command,
                output: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }

    async fn set_context_namespace(&self, namespace: &str) -> Result<(), ScriptError> {
        let flag = format!("--namespace={}", namespace);
        let output = self
            .kubectl(&["config", "set-context", "--current", &flag])
            .await?;
        debug!(namespace, %output, "Switched kubectl namespace");
        Ok(())
    }
}

#[async_trait]
impl NamespaceContext for KubectlContext {
    async fn current_namespace(&self) -> Result<Option<String>, ScriptError> {
        let namespace = self
            .kubectl(&["config", "view", "--minify", "-o", "jsonpath={..namespace}"])
            .await?;
        Ok(Some(namespace).filter(|ns| !ns.is_empty()))
    }

    async fn set_namespace(&self, namespace: &str) -> Result<(), ScriptError> {
        self.set_context_namespace(namespace).await
    }

    async fn clear_namespace(&self) -> Result<(), ScriptError> {
        self.set_context_namespace("").await
    }
}

/// Runs `f` with `namespace` as the active namespace. The previous namespace
/// is restored even when `f` fails; a failure to restore is reported when
/// `f` itself succeeded. A context without a namespace gets none back.
pub async fn with_namespace<F, T>(
    context: &dyn NamespaceContext,
    namespace: &str,
    f: F,
) -> Result<T, ScriptError>
where
    F: Future<Output = Result<T, ScriptError>>,
{
    let _guard = CONTEXT_LOCK.lock().await;
    let previous = context.current_namespace().await?;
    context.set_namespace(namespace).await?;

    let result = f.await;

    let restored = match &previous {
        Some(previous) => context.set_namespace(previous).await,
        None => context.clear_namespace().await,
    };
    match (result, restored) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(restore)) => {
            warn!(error = %restore, namespace = ?previous, "Unable to restore kubectl namespace");
            Err(e)
        }
    }
}
