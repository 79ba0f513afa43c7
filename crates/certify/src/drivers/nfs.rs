use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, VolumeNodeAffinity};
use tracing::info;

use crate::applicability::Skip;
use crate::driver::{Capability, DriverInfo};
use crate::framework::deploy::{create_from_manifests, patch_csi_deployment, PatchCsiOptions};
use crate::framework::pod::{clean_up_storage_server, create_storage_server, StorageServerConfig};
use crate::framework::Framework;
use crate::pattern::{FileSize, TestPattern, TestVolType};
use crate::testdriver::{
    PerTestConfig, PreprovisionedPvTestDriver, PreprovisionedVolumeTestDriver, TestDriver,
    TestVolume,
};

const DRIVER_NAME: &str = "csi-nfsplugin";
const PREFIX: &str = "nfs";
const SERVER_IMAGE: &str = "gcr.io/kubernetes-e2e-test-images/volume/nfs:1.0";

const MANIFESTS: &[&str] = &[
    "nfs/csi-nfsplugin-rbac.yaml",
    "nfs/csi-nfsplugin-driverinfo.yaml",
    "nfs/csi-nodeplugin-nfsplugin.yaml",
];

/// The csi-nfsplugin driver. Volumes are exports of an NFS server pod started
/// for the test case; the driver cannot provision.
pub struct NfsDriver {
    info: DriverInfo,
}

impl NfsDriver {
    pub fn new() -> Self {
        let mut info = DriverInfo::named(DRIVER_NAME)
            .with_capabilities(&[Capability::Persistence, Capability::Exec]);
        info.max_file_size = FileSize::Large;
        NfsDriver { info }
    }
}

impl Default for NfsDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn server_config() -> StorageServerConfig {
    let mut volumes = BTreeMap::new();
    volumes.insert(String::new(), "/exports".to_owned());
    StorageServerConfig {
        prefix: PREFIX.to_owned(),
        image: SERVER_IMAGE.to_owned(),
        ports: vec![2049],
        volumes,
        ready_message: Some("NFS started".to_owned()),
    }
}

#[async_trait::async_trait]
impl TestDriver for NfsDriver {
    fn driver_info(&self) -> &DriverInfo {
        &self.info
    }

    fn skip_unsupported_test(&self, pattern: &TestPattern) -> Result<(), Skip> {
        if pattern.vol_type == TestVolType::DynamicPV {
            return Err(Skip::new(
                "NFS Driver does not support dynamic provisioning -- skipping",
            ));
        }
        Ok(())
    }

    async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
        let config = PerTestConfig::new(PREFIX, framework);
        let opts = PatchCsiOptions {
            old_driver_name: DRIVER_NAME.to_owned(),
            new_driver_name: DRIVER_NAME.to_owned(),
            driver_container_name: "plugin".to_owned(),
            driver_container_arguments: vec![format!("--drivername={}", DRIVER_NAME)],
            provisioner_container_name: "csi-provisioner".to_owned(),
            node_name: None,
        };
        info!(namespace = framework.namespace(), "Deploying nfs driver");
        create_from_manifests(framework, |item| patch_csi_deployment(item, &opts), MANIFESTS)
            .await?;
        Ok(config)
    }

    fn as_preprovisioned_volume(&self) -> Option<&dyn PreprovisionedVolumeTestDriver> {
        Some(self)
    }

    fn as_preprovisioned_pv(&self) -> Option<&dyn PreprovisionedPvTestDriver> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl PreprovisionedVolumeTestDriver for NfsDriver {
    async fn create_volume(
        &self,
        framework: &Framework,
        _config: &PerTestConfig,
        vol_type: TestVolType,
    ) -> anyhow::Result<Box<dyn TestVolume>> {
        match vol_type {
            TestVolType::InlineVolume | TestVolType::PreprovisionedPV => {
                let (pod, server_ip) = create_storage_server(framework, &server_config()).await?;
                Ok(Box::new(NfsVolume {
                    server_ip,
                    server_pod: pod.metadata.name.unwrap_or_default(),
                }))
            }
            TestVolType::DynamicPV => {
                anyhow::bail!("{} cannot create volumes for {}", DRIVER_NAME, vol_type)
            }
        }
    }
}

impl PreprovisionedPvTestDriver for NfsDriver {
    fn persistent_volume_source(
        &self,
        _read_only: bool,
        _fs_type: &str,
        volume: &dyn TestVolume,
    ) -> (CSIPersistentVolumeSource, Option<VolumeNodeAffinity>) {
        let source = CSIPersistentVolumeSource {
            driver: self.info.name.clone(),
            volume_handle: "nfs-vol".to_owned(),
            volume_attributes: Some(volume.attributes()),
            ..Default::default()
        };
        (source, None)
    }
}

/// An export of the NFS server pod.
pub struct NfsVolume {
    server_ip: String,
    server_pod: String,
}

#[async_trait::async_trait]
impl TestVolume for NfsVolume {
    fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("server".to_owned(), self.server_ip.clone());
        attributes.insert("share".to_owned(), "/".to_owned());
        attributes.insert("readOnly".to_owned(), "true".to_owned());
        attributes
    }

    async fn delete_volume(&self, framework: &Framework) -> anyhow::Result<()> {
        info!(pod = %self.server_pod, "Stopping NFS server");
        clean_up_storage_server(framework, &self.server_pod).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::applicability::skip_unsupported_test;
    use crate::framework::pod::storage_server_pod;
    use crate::pattern::*;

    #[test]
    fn dynamic_provisioning_is_skipped() {
        let driver = NfsDriver::new();
        let skip = skip_unsupported_test(&driver, &DEFAULT_FS_DYNAMIC_PV).unwrap_err();
        assert_eq!(
            skip.reason,
            "Driver csi-nfsplugin doesn't support DynamicPV -- skipping"
        );
        assert_eq!(
            driver.skip_unsupported_test(&DEFAULT_FS_DYNAMIC_PV),
            Err(Skip::new(
                "NFS Driver does not support dynamic provisioning -- skipping"
            ))
        );
        assert!(skip_unsupported_test(&driver, &DEFAULT_FS_PREPROVISIONED_PV).is_ok());
        assert!(driver.driver_info().has_capability(Capability::Exec));
    }

    #[test]
    fn volume_source_points_at_the_server() {
        let driver = NfsDriver::new();
        let volume = NfsVolume {
            server_ip: "10.244.1.7".to_owned(),
            server_pod: "nfs-server".to_owned(),
        };
        let (source, affinity) = driver.persistent_volume_source(false, "", &volume);
        assert_eq!(source.driver, "csi-nfsplugin");
        assert_eq!(source.volume_handle, "nfs-vol");
        let attributes = source.volume_attributes.unwrap();
        assert_eq!(attributes["server"], "10.244.1.7");
        assert_eq!(attributes["share"], "/");
        assert_eq!(attributes["readOnly"], "true");
        assert!(affinity.is_none());
    }

    #[test]
    fn server_pod_exports_an_empty_dir() {
        let pod = storage_server_pod(&server_config()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("nfs-server"));
        let spec = pod.spec.unwrap();
        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some(SERVER_IMAGE));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 2049);
        let volumes = spec.volumes.unwrap();
        assert!(volumes[0].empty_dir.is_some());
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].mount_path,
            "/exports"
        );
    }
}
