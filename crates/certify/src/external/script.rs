use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, VolumeNodeAffinity};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use tokio::process::Command;
use tracing::{debug, info};

use super::definition::definition_snapshot_class;
use super::namespace::{with_namespace, NamespaceContext};
use super::{ScriptError, EXTERNAL_PREFIX};
use crate::applicability::{definition_supports, Skip};
use crate::driver::{DriverDefinition, DriverInfo};
use crate::framework::Framework;
use crate::manifest::ManifestError;
use crate::pattern::{TestPattern, TestVolType};
use crate::storage_class;
use crate::testdriver::{
    DynamicPvTestDriver, PerTestConfig, PreprovisionedPvTestDriver,
    PreprovisionedVolumeTestDriver, SnapshottableTestDriver, TestDriver, TestVolume,
};

const GET_DRIVER_INFO: &str = "getDriverInfo";
const CREATE_VOLUME: &str = "createVolume";
const DELETE_VOLUME: &str = "deleteVolume";

/// Sources a driver script into `bash` and calls one of its functions.
#[derive(Clone)]
struct ScriptRunner {
    script: PathBuf,
    context: Arc<dyn NamespaceContext>,
}

impl ScriptRunner {
    async fn has_function(&self, function: &str) -> Result<bool, ScriptError> {
        let check = format!(
            ". {} && type {} &>/dev/null && echo found || echo not found",
            shell_quote(&self.script),
            function
        );
        let stdout = self.bash(&check, function, &[]).await?;
        Ok(stdout.trim() == "found")
    }

    /// Runs `function`. With a namespace, the active kubectl namespace points
    /// at it for the duration of the call.
    async fn call(
        &self,
        function: &str,
        namespace: Option<&str>,
        args: &[&str],
    ) -> Result<String, ScriptError> {
        let command = format!(". {} && {} \"$@\"", shell_quote(&self.script), function);
        match namespace {
            Some(namespace) => {
                with_namespace(
                    self.context.as_ref(),
                    namespace,
                    self.bash(&command, function, args),
                )
                .await
            }
            None => self.bash(&command, function, args).await,
        }
    }

    async fn bash(&self, command: &str, function: &str, args: &[&str]) -> Result<String, ScriptError> {
        debug!(script = %self.script.display(), function, "Running driver script");
        let output = Command::new("bash")
            .arg("-c")
            .arg(command)
            .arg("bash")
            .args(args)
            .output()
            .await
            .map_err(|source| ScriptError::Spawn {
                command: format!("bash -c {:?}", command),
                source,
            })?;
        if !output.status.success() {
            return Err(ScriptError::Failed {
                script: self.script.clone(),
                function: function.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// A driver implemented by a bash script. `getDriverInfo` prints the driver
/// definition; `createVolume` and `deleteVolume` are optional and together
/// enable the pre-provisioned patterns.
pub struct ScriptDriver {
    runner: ScriptRunner,
    definition: DriverDefinition,
    preprovisioned: bool,
}

impl ScriptDriver {
    pub async fn load(
        script: &Path,
        context: Arc<dyn NamespaceContext>,
    ) -> Result<Self, ScriptError> {
        if script.as_os_str().is_empty() {
            return Err(ScriptError::MissingFileName);
        }
        let runner = ScriptRunner {
            script: script.to_owned(),
            context,
        };
        if !runner.has_function(GET_DRIVER_INFO).await? {
            return Err(ScriptError::MissingFunction {
                script: script.to_owned(),
                function: GET_DRIVER_INFO.to_owned(),
            });
        }
        let stdout = runner.call(GET_DRIVER_INFO, None, &[]).await?;
        let origin = format!("{} {}", script.display(), GET_DRIVER_INFO);
        let definition = DriverDefinition::from_slice(stdout.as_bytes(), &origin)?;

        let preprovisioned = runner.has_function(CREATE_VOLUME).await?
            && runner.has_function(DELETE_VOLUME).await?;
        info!(
            driver = %definition.driver_info.name,
            script = %script.display(),
            preprovisioned,
            "Loaded driver script"
        );
        Ok(ScriptDriver {
            runner,
            definition,
            preprovisioned,
        })
    }

    pub fn definition(&self) -> &DriverDefinition {
        &self.definition
    }

    pub fn supports_preprovisioned(&self) -> bool {
        self.preprovisioned
    }

    /// Runs `createVolume` in `namespace`. The script prints the volume
    /// attributes as a JSON object of strings.
    pub async fn create_volume_in(&self, namespace: &str) -> Result<ScriptVolume, ScriptError> {
        let stdout = self
            .runner
            .call(CREATE_VOLUME, Some(namespace), &[])
            .await?;
        let attributes: BTreeMap<String, String> =
            serde_json::from_str(stdout.trim()).map_err(|source| ScriptError::VolumeAttributes {
                script: self.runner.script.clone(),
                source,
            })?;
        info!(driver = %self.definition.driver_info.name, namespace, "Created volume");
        Ok(ScriptVolume {
            attributes,
            namespace: namespace.to_owned(),
            runner: self.runner.clone(),
        })
    }
}

#[async_trait::async_trait]
impl TestDriver for ScriptDriver {
    fn driver_info(&self) -> &DriverInfo {
        &self.definition.driver_info
    }

    fn skip_unsupported_test(&self, pattern: &TestPattern) -> Result<(), Skip> {
        definition_supports(&self.definition, pattern, self.preprovisioned)
    }

    async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
        let mut config = PerTestConfig::new(EXTERNAL_PREFIX, framework);
        config.client_node_name = self.definition.client_node_name.clone();
        Ok(config)
    }

    fn as_dynamic_pv(&self) -> Option<&dyn DynamicPvTestDriver> {
        Some(self)
    }

    fn as_preprovisioned_volume(&self) -> Option<&dyn PreprovisionedVolumeTestDriver> {
        Some(self)
    }

    fn as_preprovisioned_pv(&self) -> Option<&dyn PreprovisionedPvTestDriver> {
        Some(self)
    }

    fn as_snapshottable(&self) -> Option<&dyn SnapshottableTestDriver> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl DynamicPvTestDriver for ScriptDriver {
    async fn dynamic_provision_storage_class(
        &self,
        _config: &PerTestConfig,
        fs_type: &str,
    ) -> Result<StorageClass, ManifestError> {
        storage_class::definition_storage_class(&self.definition, fs_type).await
    }

    fn claim_size(&self) -> String {
        self.definition.claim_size.clone()
    }
}

#[async_trait::async_trait]
impl PreprovisionedVolumeTestDriver for ScriptDriver {
    async fn create_volume(
        &self,
        _framework: &Framework,
        config: &PerTestConfig,
        _vol_type: TestVolType,
    ) -> anyhow::Result<Box<dyn TestVolume>> {
        let volume = self.create_volume_in(&config.namespace).await?;
        Ok(Box::new(volume))
    }
}

impl PreprovisionedPvTestDriver for ScriptDriver {
    fn persistent_volume_source(
        &self,
        read_only: bool,
        fs_type: &str,
        volume: &dyn TestVolume,
    ) -> (CSIPersistentVolumeSource, Option<VolumeNodeAffinity>) {
        let name = &self.definition.driver_info.name;
        let source = CSIPersistentVolumeSource {
            driver: name.clone(),
            volume_handle: format!("{}-vol", name),
            volume_attributes: Some(volume.attributes()),
            read_only: Some(read_only),
            fs_type: if fs_type.is_empty() {
                None
            } else {
                Some(fs_type.to_owned())
            },
            ..Default::default()
        };
        (source, None)
    }
}

impl SnapshottableTestDriver for ScriptDriver {
    fn snapshot_class(&self, config: &PerTestConfig) -> Result<DynamicObject, Skip> {
        definition_snapshot_class(&self.definition, config)
    }
}

/// A volume created by a driver script.
pub struct ScriptVolume {
    attributes: BTreeMap<String, String>,
    namespace: String,
    runner: ScriptRunner,
}

impl ScriptVolume {
    /// Runs `deleteVolume` in the namespace the volume was created in. The
    /// attributes are passed as the only argument, encoded as JSON.
    pub async fn delete(&self) -> Result<(), ScriptError> {
        let attributes = serde_json::to_string(&self.attributes).map_err(|source| {
            ScriptError::VolumeAttributes {
                script: self.runner.script.clone(),
                source,
            }
        })?;
        self.runner
            .call(DELETE_VOLUME, Some(&self.namespace), &[&attributes])
            .await?;
        info!(namespace = %self.namespace, "Deleted volume");
        Ok(())
    }
}

#[async_trait::async_trait]
impl TestVolume for ScriptVolume {
    fn attributes(&self) -> BTreeMap<String, String> {
        self.attributes.clone()
    }

    async fn delete_volume(&self, _framework: &Framework) -> anyhow::Result<()> {
        self.delete().await?;
        Ok(())
    }
}
