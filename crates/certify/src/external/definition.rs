use std::path::Path;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use tracing::info;

use super::EXTERNAL_PREFIX;
use crate::applicability::{definition_supports, Skip};
use crate::driver::{DefinitionError, DriverDefinition, DriverInfo};
use crate::framework::Framework;
use crate::manifest::ManifestError;
use crate::pattern::TestPattern;
use crate::storage_class;
use crate::testdriver::{
    DynamicPvTestDriver, PerTestConfig, SnapshottableTestDriver, TestDriver,
};

/// A driver known only through a [`DriverDefinition`]. Nothing is deployed;
/// the driver must already run in the cluster.
#[derive(Clone, Debug)]
pub struct DefinitionDriver {
    definition: DriverDefinition,
}

/// Reads a `.yaml` or `.json` driver definition.
pub async fn load_driver_definition(path: &Path) -> Result<DefinitionDriver, DefinitionError> {
    let definition = DriverDefinition::from_file(path).await?;
    info!(
        driver = %definition.driver_info.name,
        path = %path.display(),
        "Loaded driver definition"
    );
    Ok(DefinitionDriver::new(definition))
}

impl DefinitionDriver {
    pub fn new(definition: DriverDefinition) -> Self {
        DefinitionDriver { definition }
    }

    pub fn definition(&self) -> &DriverDefinition {
        &self.definition
    }
}

#[async_trait::async_trait]
impl TestDriver for DefinitionDriver {
    fn driver_info(&self) -> &DriverInfo {
        &self.definition.driver_info
    }

    fn skip_unsupported_test(&self, pattern: &TestPattern) -> Result<(), Skip> {
        definition_supports(&self.definition, pattern, false)
    }

    async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
        let mut config = PerTestConfig::new(EXTERNAL_PREFIX, framework);
        config.client_node_name = self.definition.client_node_name.clone();
        Ok(config)
    }

    fn as_dynamic_pv(&self) -> Option<&dyn DynamicPvTestDriver> {
        Some(self)
    }

    fn as_snapshottable(&self) -> Option<&dyn SnapshottableTestDriver> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl DynamicPvTestDriver for DefinitionDriver {
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

impl SnapshottableTestDriver for DefinitionDriver {
    fn snapshot_class(&self, config: &PerTestConfig) -> Result<DynamicObject, Skip> {
        definition_snapshot_class(&self.definition, config)
    }
}

pub(super) fn definition_snapshot_class(
    definition: &DriverDefinition,
    config: &PerTestConfig,
) -> Result<DynamicObject, Skip> {
    if !definition.snapshot_class.from_name {
        return Err(Skip::new(format!(
            "Driver {:?} does not support snapshotting - skipping",
            definition.driver_info.name
        )));
    }
    Ok(storage_class::snapshot_class(
        &definition.driver_info.name,
        &config.namespace,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::applicability::skip_unsupported_test;
    use crate::pattern::*;
    use std::io::Write;

    async fn driver_from(yaml: &str) -> DefinitionDriver {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        load_driver_definition(file.path()).await.unwrap()
    }

    #[tokio::test]
    async fn from_name_definition_runs_dynamic_patterns_only() {
        let driver = driver_from(
            "DriverInfo:\n  Name: hostpath.csi.k8s.io\nStorageClass:\n  FromName: true\n",
        )
        .await;
        assert!(skip_unsupported_test(&driver, &DEFAULT_FS_DYNAMIC_PV).is_ok());
        assert!(skip_unsupported_test(&driver, &DEFAULT_FS_PREPROVISIONED_PV).is_err());
        assert!(skip_unsupported_test(&driver, &DEFAULT_FS_INLINE_VOLUME).is_err());
        // ext4 is not listed in SupportedFsType.
        assert!(skip_unsupported_test(&driver, &EXT4_DYNAMIC_PV).is_err());

        let class = driver
            .as_dynamic_pv()
            .unwrap()
            .dynamic_provision_storage_class(
                &PerTestConfig::for_namespace(EXTERNAL_PREFIX, "ns", "ns"),
                "",
            )
            .await
            .unwrap();
        assert_eq!(class.provisioner, "hostpath.csi.k8s.io");
        assert_eq!(driver.as_dynamic_pv().unwrap().claim_size(), "5Gi");
    }

    #[tokio::test]
    async fn definition_without_storage_class_skips_dynamic_patterns() {
        let driver = driver_from("DriverInfo:\n  Name: bare\n").await;
        let skip = skip_unsupported_test(&driver, &DEFAULT_FS_DYNAMIC_PV).unwrap_err();
        assert_eq!(
            skip.reason,
            r#"Driver "bare" does not support volume type "DynamicPV" - skipping"#
        );
    }

    #[tokio::test]
    async fn snapshot_class_needs_from_name() {
        let config = PerTestConfig::for_namespace(EXTERNAL_PREFIX, "csi-certify-a", "csi-certify-a");
        let driver = driver_from("DriverInfo:\n  Name: snap.csi\n").await;
        let skip = driver
            .as_snapshottable()
            .unwrap()
            .snapshot_class(&config)
            .unwrap_err();
        assert_eq!(
            skip.reason,
            r#"Driver "snap.csi" does not support snapshotting - skipping"#
        );

        let driver =
            driver_from("DriverInfo:\n  Name: snap.csi\nSnapshotClass:\n  FromName: true\n").await;
        let class = driver
            .as_snapshottable()
            .unwrap()
            .snapshot_class(&config)
            .unwrap();
        assert_eq!(
            class.metadata.name.as_deref(),
            Some("csi-certify-a-snap.csi-vsc")
        );
        assert_eq!(class.data["driver"], "snap.csi");
    }

    #[tokio::test]
    async fn prepare_config_carries_client_node() {
        let driver = driver_from("DriverInfo:\n  Name: pinned\nClientNodeName: node-7\n").await;
        assert_eq!(
            driver.definition().client_node_name.as_deref(),
            Some("node-7")
        );
    }
}
