//! The per test case environment: a Kubernetes client, a fresh namespace and
//! bookkeeping for everything created inside it.
//!
//! A [`Framework`] is set up before a test case and torn down after it.
//! Teardown deletes every tracked object, newest first, and then the
//! namespace. Failures during teardown are logged and never fail the case.
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use crate::manifest::ManifestSource;

pub mod deploy;
pub mod logs;
pub mod pod;
pub mod resources;

use logs::PodLogWatcher;
use resources::{is_not_found, TestResourceManager};

/// Every test namespace starts with this prefix.
pub const NAMESPACE_PREFIX: &str = "csi-certify-";

/// Label put on test namespaces, holding the framework's base name.
pub const NAMESPACE_LABEL: &str = "csi-certify/base-name";

/// The environment a single test case runs in.
pub struct Framework {
    client: kube::Client,
    base_name: String,
    namespace: String,
    manifests: ManifestSource,
    resources: TestResourceManager,
    log_watcher: Option<PodLogWatcher>,
}

impl Framework {
    /// Creates the test namespace and starts copying pod output into the log.
    pub async fn setup(
        client: kube::Client,
        base_name: &str,
        manifests: ManifestSource,
    ) -> anyhow::Result<Self> {
        let namespace = namespace_name(base_name, &mut rand::thread_rng());
        let ns: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": {
                    NAMESPACE_LABEL: base_name,
                },
            },
        }))?;
        Api::<Namespace>::all(client.clone())
            .create(&PostParams::default(), &ns)
            .await?;
        info!(%namespace, "Created test namespace");

        let log_watcher = PodLogWatcher::start(client.clone(), &namespace);
        Ok(Framework {
            resources: TestResourceManager::new(client.clone(), &namespace),
            client,
            base_name: base_name.to_owned(),
            namespace,
            manifests,
            log_watcher: Some(log_watcher),
        })
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Unique for this test case. Cluster scoped objects carry it in their
    /// names.
    pub fn unique_name(&self) -> &str {
        &self.namespace
    }

    pub fn manifests(&self) -> &ManifestSource {
        &self.manifests
    }

    pub fn resources(&mut self) -> &mut TestResourceManager {
        &mut self.resources
    }

    /// Deletes the tracked objects and the namespace.
    pub async fn teardown(mut self) {
        self.resources.clean_up().await;
        if let Some(watcher) = self.log_watcher.take() {
            watcher.stop();
        }
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces
            .delete(&self.namespace, &Default::default())
            .await
        {
            Ok(_) => info!(namespace = %self.namespace, "Deleted test namespace"),
            Err(e) if is_not_found(&e) => (),
            Err(e) => warn!(namespace = %self.namespace, error = %e, "Unable to delete test namespace"),
        }
    }
}

/// `csi-certify-<base>-<5 random characters>`, a valid DNS label.
pub fn namespace_name<R: Rng>(base_name: &str, rng: &mut R) -> String {
    let suffix: String = (0..5)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .collect();
    format!("{}{}-{}", NAMESPACE_PREFIX, base_name, suffix)
}
