use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::storage::v1::StorageClass;
use rand::seq::SliceRandom;
use tracing::info;

use crate::applicability::Skip;
use crate::driver::{Capability, DriverInfo};
use crate::framework::deploy::{create_from_manifests, patch_csi_deployment, PatchCsiOptions};
use crate::framework::pod::ready_schedulable_nodes;
use crate::framework::Framework;
use crate::manifest::ManifestError;
use crate::pattern::{csi_tune_pattern, FileSize, TestPattern};
use crate::storage_class::derive_storage_class;
use crate::testdriver::{DynamicPvTestDriver, PerTestConfig, TestDriver};

const DRIVER_NAME: &str = "csi-hostpath";

const MANIFESTS: &[&str] = &[
    "hostpath/csi-hostpath-rbac.yaml",
    "hostpath/csi-hostpath-driverinfo.yaml",
    "hostpath/csi-hostpath-plugin.yaml",
    "hostpath/e2e-test-rbac.yaml",
];

/// The csi-hostpath driver, deployed on a single random node for every test
/// case under a name unique to the case.
pub struct HostpathDriver {
    info: DriverInfo,
}

impl HostpathDriver {
    pub fn new() -> Self {
        let mut info = DriverInfo::named(DRIVER_NAME).with_capabilities(&[Capability::Persistence]);
        info.max_file_size = FileSize::Medium;
        HostpathDriver { info }
    }
}

impl Default for HostpathDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn patch_options(new_driver_name: &str, node_name: &str) -> PatchCsiOptions {
    PatchCsiOptions {
        old_driver_name: DRIVER_NAME.to_owned(),
        new_driver_name: new_driver_name.to_owned(),
        driver_container_name: "hostpath".to_owned(),
        driver_container_arguments: vec![format!("--drivername={}", new_driver_name)],
        provisioner_container_name: "csi-provisioner".to_owned(),
        node_name: Some(node_name.to_owned()),
    }
}

fn random_node_name(nodes: &[Node]) -> anyhow::Result<String> {
    nodes
        .choose(&mut rand::thread_rng())
        .and_then(|n| n.metadata.name.clone())
        .ok_or_else(|| anyhow::anyhow!("no ready schedulable node to deploy {} on", DRIVER_NAME))
}

#[async_trait::async_trait]
impl TestDriver for HostpathDriver {
    fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    fn skip_unsupported_test(&self, _pattern: &TestPattern) -> Result<(), Skip> {
        Ok(())
    }

    async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
        let nodes = ready_schedulable_nodes(framework.client()).await?;
        let node_name = random_node_name(&nodes)?;

        let mut config = PerTestConfig::new("hostpath", framework);
        config.client_node_name = Some(node_name.clone());
        let driver_name = config.unique_driver_name(&self.info);
        info!(driver = %driver_name, node = %node_name, "Deploying hostpath driver");

        let opts = patch_options(&driver_name, &node_name);
        create_from_manifests(framework, |item| patch_csi_deployment(item, &opts), MANIFESTS)
            .await?;
        Ok(config)
    }

    fn tune_patterns(&self, patterns: &[TestPattern]) -> Vec<TestPattern> {
        csi_tune_pattern(patterns)
    }

    fn as_dynamic_pv(&self) -> Option<&dyn DynamicPvTestDriver> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl DynamicPvTestDriver for HostpathDriver {
    async fn dynamic_provision_storage_class(
        &self,
        config: &PerTestConfig,
        fs_type: &str,
    ) -> Result<StorageClass, ManifestError> {
        Ok(derive_storage_class(
            &config.unique_driver_name(&self.info),
            fs_type,
        ))
    }

    fn claim_size(&self) -> String {
        "5Gi".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::applicability::skip_unsupported_test;
    use crate::manifest::ManifestSource;
    use crate::pattern::*;
    use serde_json::json;

    #[test]
    fn only_dynamic_patterns_survive_tuning() {
        let driver = HostpathDriver::new();
        let tuned = driver.tune_patterns(&[
            DEFAULT_FS_INLINE_VOLUME,
            DEFAULT_FS_PREPROVISIONED_PV,
            DEFAULT_FS_DYNAMIC_PV,
        ]);
        assert_eq!(tuned, vec![DEFAULT_FS_DYNAMIC_PV]);
        assert!(skip_unsupported_test(&driver, &DEFAULT_FS_DYNAMIC_PV).is_ok());
        assert!(skip_unsupported_test(&driver, &EXT4_DYNAMIC_PV).is_err());
        assert!(skip_unsupported_test(&driver, &BLOCK_VOL_MODE_DYNAMIC_PV).is_err());
    }

    #[tokio::test]
    async fn storage_class_uses_the_unique_driver_name() {
        let driver = HostpathDriver::new();
        let config = PerTestConfig::for_namespace("hostpath", "csi-certify-p-1a2b3", "csi-certify-p-1a2b3");
        let class = driver
            .dynamic_provision_storage_class(&config, "")
            .await
            .unwrap();
        assert_eq!(class.provisioner, "csi-hostpath-csi-certify-p-1a2b3");
        assert_eq!(
            class.metadata.name.as_deref(),
            Some("csi-hostpath-csi-certify-p-1a2b3-sc")
        );
    }

    #[test]
    fn no_nodes_is_an_error() {
        assert!(random_node_name(&[]).is_err());
        let node: Node = serde_json::from_value(json!({"metadata": {"name": "kind-worker"}})).unwrap();
        assert_eq!(random_node_name(&[node]).unwrap(), "kind-worker");
    }

    #[tokio::test]
    async fn embedded_manifests_are_renamed_for_the_test() {
        let opts = patch_options("csi-hostpath-ns1", "kind-worker");
        let mut items = Vec::new();
        for file in MANIFESTS {
            items.extend(ManifestSource::Embedded.load(file).await.unwrap());
        }

        let driver = items
            .iter_mut()
            .find(|i| i["kind"] == "CSIDriver")
            .expect("manifests carry a CSIDriver");
        patch_csi_deployment(driver, &opts);
        assert_eq!(driver["metadata"]["name"], "csi-hostpath-ns1");

        let plugin = items
            .iter_mut()
            .find(|i| i["kind"] == "StatefulSet")
            .expect("manifests carry the plugin StatefulSet");
        patch_csi_deployment(plugin, &opts);
        assert_eq!(plugin["spec"]["template"]["spec"]["nodeName"], "kind-worker");
        let containers = plugin["spec"]["template"]["spec"]["containers"]
            .as_array()
            .unwrap();
        let hostpath = containers.iter().find(|c| c["name"] == "hostpath").unwrap();
        assert!(hostpath["args"]
            .as_array()
            .unwrap()
            .contains(&json!("--drivername=csi-hostpath-ns1")));
        let provisioner = containers
            .iter()
            .find(|c| c["name"] == "csi-provisioner")
            .unwrap();
        assert!(provisioner["args"]
            .as_array()
            .unwrap()
            .contains(&json!("--provisioner=csi-hostpath-ns1")));
    }
}
