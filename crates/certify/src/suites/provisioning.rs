//! Dynamic provisioning: a claim against the driver's StorageClass gets a
//! volume matching what was asked for, the volume holds data, and it goes
//! away with the claim.
use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use tracing::info;

use super::resource::{claim, create_claim, create_storage_class, reclaim_policy, VolumeResource};
use super::{TestSuite, TestSuiteInfo};
use crate::applicability::Skip;
use crate::driver::Capability;
use crate::framework::pod::{
    run_in_pod_with_volume, wait_for_pvc_bound, CLAIM_PROVISION_TIMEOUT, TEST_MOUNT_PATH,
};
use crate::framework::Framework;
use crate::pattern::{TestPattern, TestVolMode, DEFAULT_FS_DYNAMIC_PV};
use crate::quantity::quantity_bytes;
use crate::testdriver::{PerTestConfig, TestDriver};

pub const PROVISION_WITH_DEFAULTS: &str = "should provision storage with defaults";
pub const PROVISION_WITH_MOUNT_OPTIONS: &str = "should provision storage with mount options";
pub const BLOCK_VOLUMES: &str = "should create and delete block persistent volumes";

const CASES: &[&str] = &[
    PROVISION_WITH_DEFAULTS,
    PROVISION_WITH_MOUNT_OPTIONS,
    BLOCK_VOLUMES,
];

const TEST_DATA: &str = "hello world";

pub struct ProvisioningTestSuite {
    info: TestSuiteInfo,
}

impl ProvisioningTestSuite {
    pub fn new() -> Self {
        ProvisioningTestSuite {
            info: TestSuiteInfo {
                name: "provisioning",
                patterns: vec![DEFAULT_FS_DYNAMIC_PV],
            },
        }
    }
}

impl Default for ProvisioningTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TestSuite for ProvisioningTestSuite {
    fn info(&self) -> &TestSuiteInfo {
        &self.info
    }

    fn case_names(&self) -> &'static [&'static str] {
        CASES
    }

    fn skip_unsupported(
        &self,
        case: &str,
        driver: &dyn TestDriver,
        _pattern: &TestPattern,
    ) -> Result<(), Skip> {
        let info = driver.driver_info();
        match case {
            PROVISION_WITH_MOUNT_OPTIONS if info.supported_mount_option.is_none() => Err(
                Skip::new(format!("Driver {} does not support mount options -- skipping", info.name)),
            ),
            BLOCK_VOLUMES if !info.has_capability(Capability::Block) => Err(Skip::new(format!(
                "Driver {} does not support BlockVolume -- skipping",
                info.name
            ))),
            _ => Ok(()),
        }
    }

    async fn run_case(
        &self,
        case: &str,
        driver: &dyn TestDriver,
        config: &PerTestConfig,
        pattern: &TestPattern,
        framework: &mut Framework,
    ) -> anyhow::Result<()> {
        let info = driver.driver_info();
        let dynamic = driver
            .as_dynamic_pv()
            .ok_or_else(|| anyhow::anyhow!("{} cannot provision volumes", info.name))?;

        let mut class = dynamic
            .dynamic_provision_storage_class(config, pattern.fs_type)
            .await?;
        if case == PROVISION_WITH_MOUNT_OPTIONS {
            class.mount_options = Some(info.mount_options());
        }
        let vol_mode = if case == BLOCK_VOLUMES {
            TestVolMode::Block
        } else {
            pattern.vol_mode
        };

        let class = create_storage_class(framework, class).await?;
        let claim_name = format!("{}-pvc", config.prefix);
        let request = claim(
            &claim_name,
            class.metadata.name.as_deref(),
            &dynamic.claim_size(),
            vol_mode,
            None,
        )?;
        create_claim(framework, &request).await?;
        let (claim, pv) = wait_for_pvc_bound(
            framework.client(),
            framework.namespace(),
            &claim_name,
            CLAIM_PROVISION_TIMEOUT,
        )
        .await?;
        check_provisioned_volume(&class, &claim, &pv, vol_mode)?;

        if vol_mode == TestVolMode::Filesystem {
            let node = config.client_node_name.as_deref();
            let data = format!("{}/data", TEST_MOUNT_PATH);
            info!(claim = %claim_name, "Checking that the volume is writable");
            run_in_pod_with_volume(
                framework,
                &claim_name,
                "pvc-volume-tester-writer",
                &format!("echo '{}' > {}", TEST_DATA, data),
                node,
            )
            .await?;
            info!(claim = %claim_name, "Checking that the volume is readable");
            run_in_pod_with_volume(
                framework,
                &claim_name,
                "pvc-volume-tester-reader",
                &format!("grep '{}' {}", TEST_DATA, data),
                node,
            )
            .await?;
        }

        VolumeResource::provisioned(class, claim, pv)
            .clean_up(framework)
            .await
    }
}

/// Compares a provisioned volume with the claim and class it came from.
pub fn check_provisioned_volume(
    class: &StorageClass,
    claim: &PersistentVolumeClaim,
    pv: &PersistentVolume,
    vol_mode: TestVolMode,
) -> anyhow::Result<()> {
    let pv_name = pv.metadata.name.as_deref().unwrap_or_default();
    let pv_spec = pv
        .spec
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("volume {} has no spec", pv_name))?;
    let claim_spec = claim
        .spec
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("claim has no spec"))?;

    let requested = claim_spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .ok_or_else(|| anyhow::anyhow!("claim requests no storage"))?;
    let capacity = pv_spec
        .capacity
        .as_ref()
        .and_then(|c| c.get("storage"))
        .ok_or_else(|| anyhow::anyhow!("volume {} has no capacity", pv_name))?;
    if quantity_bytes(capacity)? < quantity_bytes(requested)? {
        anyhow::bail!(
            "volume {} has {} but {} was requested",
            pv_name,
            capacity.0,
            requested.0
        );
    }

    let pv_modes = pv_spec.access_modes.clone().unwrap_or_default();
    for mode in claim_spec.access_modes.iter().flatten() {
        if !pv_modes.contains(mode) {
            anyhow::bail!("volume {} lacks access mode {}", pv_name, mode);
        }
    }

    let claim_name = claim.metadata.name.as_deref();
    let claim_ref = pv_spec.claim_ref.as_ref();
    if claim_ref.and_then(|r| r.name.as_deref()) != claim_name
        || claim_ref.and_then(|r| r.namespace.as_deref()) != claim.metadata.namespace.as_deref()
    {
        anyhow::bail!(
            "volume {} is not bound to claim {}",
            pv_name,
            claim_name.unwrap_or_default()
        );
    }

    let expected_policy = class.reclaim_policy.as_deref().unwrap_or("Delete");
    if reclaim_policy(pv) != expected_policy {
        anyhow::bail!(
            "volume {} has reclaim policy {}, class {}",
            pv_name,
            reclaim_policy(pv),
            expected_policy
        );
    }

    let class_options: BTreeSet<_> = class.mount_options.iter().flatten().collect();
    let pv_options: BTreeSet<_> = pv_spec.mount_options.iter().flatten().collect();
    if class_options != pv_options {
        anyhow::bail!(
            "volume {} has mount options {:?}, class {:?}",
            pv_name,
            pv_options,
            class_options
        );
    }

    if vol_mode == TestVolMode::Block && pv_spec.volume_mode.as_deref() != Some("Block") {
        anyhow::bail!("volume {} is not a block volume", pv_name);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::DriverInfo;
    use crate::storage_class::derive_storage_class;
    use serde_json::json;

    fn bound_claim() -> PersistentVolumeClaim {
        serde_json::from_value(json!({
            "metadata": {"name": "hostpath-pvc", "namespace": "csi-certify-p-abcde"},
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": "5Gi"}},
                "storageClassName": "csi-hostpath-sc",
                "volumeName": "pvc-1234",
            }
        }))
        .unwrap()
    }

    fn volume(capacity: &str, options: serde_json::Value, mode: &str) -> PersistentVolume {
        serde_json::from_value(json!({
            "metadata": {"name": "pvc-1234"},
            "spec": {
                "accessModes": ["ReadWriteOnce"],
                "capacity": {"storage": capacity},
                "claimRef": {"name": "hostpath-pvc", "namespace": "csi-certify-p-abcde"},
                "persistentVolumeReclaimPolicy": "Delete",
                "mountOptions": options,
                "volumeMode": mode,
            }
        }))
        .unwrap()
    }

    #[test]
    fn matching_volume_passes() {
        let class = derive_storage_class("csi-hostpath", "");
        let pv = volume("5368709120", json!(null), "Filesystem");
        check_provisioned_volume(&class, &bound_claim(), &pv, TestVolMode::Filesystem).unwrap();
    }

    #[test]
    fn small_volume_fails() {
        let class = derive_storage_class("csi-hostpath", "");
        let pv = volume("1Gi", json!(null), "Filesystem");
        let err = check_provisioned_volume(&class, &bound_claim(), &pv, TestVolMode::Filesystem)
            .unwrap_err();
        assert_eq!(err.to_string(), "volume pvc-1234 has 1Gi but 5Gi was requested");
    }

    #[test]
    fn mount_options_must_match_the_class() {
        let mut class = derive_storage_class("csi-hostpath", "");
        class.mount_options = Some(vec!["debug".to_owned(), "nouid32".to_owned()]);
        let pv = volume("5Gi", json!(["nouid32", "debug"]), "Filesystem");
        check_provisioned_volume(&class, &bound_claim(), &pv, TestVolMode::Filesystem).unwrap();

        let pv = volume("5Gi", json!(["debug"]), "Filesystem");
        assert!(
            check_provisioned_volume(&class, &bound_claim(), &pv, TestVolMode::Filesystem).is_err()
        );
    }

    #[test]
    fn block_claims_need_block_volumes() {
        let class = derive_storage_class("csi-hostpath", "");
        let pv = volume("5Gi", json!(null), "Filesystem");
        let err = check_provisioned_volume(&class, &bound_claim(), &pv, TestVolMode::Block)
            .unwrap_err();
        assert_eq!(err.to_string(), "volume pvc-1234 is not a block volume");
    }

    #[test]
    fn volume_bound_elsewhere_fails() {
        let class = derive_storage_class("csi-hostpath", "");
        let mut claim = bound_claim();
        claim.metadata.namespace = Some("other".to_owned());
        let pv = volume("5Gi", json!(null), "Filesystem");
        assert!(check_provisioned_volume(&class, &claim, &pv, TestVolMode::Filesystem).is_err());
    }

    struct Info(DriverInfo);

    #[async_trait::async_trait]
    impl TestDriver for Info {
        fn driver_info(&self) -> &DriverInfo {
            &self.0
        }

        fn skip_unsupported_test(&self, _pattern: &TestPattern) -> Result<(), Skip> {
            Ok(())
        }

        async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
            Ok(PerTestConfig::new("info", framework))
        }
    }

    #[test]
    fn optional_cases_need_driver_support() {
        let suite = ProvisioningTestSuite::new();
        let plain = Info(DriverInfo::named("plain"));
        assert!(suite
            .skip_unsupported(PROVISION_WITH_DEFAULTS, &plain, &DEFAULT_FS_DYNAMIC_PV)
            .is_ok());
        assert_eq!(
            suite
                .skip_unsupported(PROVISION_WITH_MOUNT_OPTIONS, &plain, &DEFAULT_FS_DYNAMIC_PV)
                .unwrap_err()
                .reason,
            "Driver plain does not support mount options -- skipping"
        );
        assert!(suite
            .skip_unsupported(BLOCK_VOLUMES, &plain, &DEFAULT_FS_DYNAMIC_PV)
            .is_err());

        let mut info = DriverInfo::named("capable").with_capabilities(&[Capability::Block]);
        info.supported_mount_option = Some(vec!["debug".to_owned()].into_iter().collect());
        let capable = Info(info);
        assert!(suite
            .skip_unsupported(PROVISION_WITH_MOUNT_OPTIONS, &capable, &DEFAULT_FS_DYNAMIC_PV)
            .is_ok());
        assert!(suite
            .skip_unsupported(BLOCK_VOLUMES, &capable, &DEFAULT_FS_DYNAMIC_PV)
            .is_ok());
    }
}
