//! The volume a test case runs against, however the pattern asks for it to
//! be created.
use std::future::Future;

use k8s_openapi::api::core::v1::{
    CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeClaim, VolumeNodeAffinity,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, PostParams};
use serde_json::json;
use tracing::{info, warn};

use crate::driver::DEFAULT_CLAIM_SIZE;
use crate::framework::pod::{
    wait_for_pv_deleted, wait_for_pvc_bound, CLAIM_PROVISION_TIMEOUT, PV_DELETE_POLL,
    PV_DELETE_TIMEOUT,
};
use crate::framework::resources::{is_not_found, TestResource};
use crate::framework::Framework;
use crate::pattern::{TestPattern, TestVolMode, TestVolType};
use crate::storage_class::patch_name;
use crate::testdriver::{PerTestConfig, PreprovisionedPvTestDriver, TestDriver, TestVolume};

/// A claim requesting `size` in ReadWriteOnce mode. Without a class name the
/// claim opts out of dynamic provisioning and binds to `volume_name`.
pub fn claim(
    name: &str,
    class_name: Option<&str>,
    size: &str,
    vol_mode: TestVolMode,
    volume_name: Option<&str>,
) -> anyhow::Result<PersistentVolumeClaim> {
    let claim = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": name,
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "resources": {
                "requests": {
                    "storage": size,
                },
            },
            "storageClassName": class_name.unwrap_or(""),
            "volumeMode": vol_mode.as_str(),
            "volumeName": volume_name,
        }
    }))?;
    Ok(claim)
}

/// A volume the driver created outside of Kubernetes, made available under
/// `name`.
pub fn preprovisioned_pv(
    name: &str,
    source: CSIPersistentVolumeSource,
    node_affinity: Option<VolumeNodeAffinity>,
    size: &str,
    vol_mode: TestVolMode,
) -> anyhow::Result<PersistentVolume> {
    let pv = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "PersistentVolume",
        "metadata": {
            "name": name,
        },
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "capacity": {
                "storage": size,
            },
            "csi": source,
            "nodeAffinity": node_affinity,
            "persistentVolumeReclaimPolicy": "Retain",
            "storageClassName": "",
            "volumeMode": vol_mode.as_str(),
        }
    }))?;
    Ok(pv)
}

/// Creates the class under a name unique to the test case.
pub async fn create_storage_class(
    framework: &mut Framework,
    mut class: StorageClass,
) -> anyhow::Result<StorageClass> {
    let name = class.metadata.name.clone().unwrap_or_default();
    if !name.contains(framework.unique_name()) {
        class.metadata.name = Some(patch_name(&name, framework.unique_name()));
    }
    let classes: Api<StorageClass> = Api::all(framework.client());
    let class = classes.create(&PostParams::default(), &class).await?;
    let name = class.metadata.name.clone().unwrap_or_default();
    info!(class = %name, provisioner = %class.provisioner, "Created storage class");
    framework.resources().push(TestResource::StorageClass(name));
    Ok(class)
}

pub async fn create_claim(
    framework: &mut Framework,
    claim: &PersistentVolumeClaim,
) -> anyhow::Result<PersistentVolumeClaim> {
    let claims: Api<PersistentVolumeClaim> =
        Api::namespaced(framework.client(), framework.namespace());
    let claim = claims.create(&PostParams::default(), claim).await?;
    let name = claim.metadata.name.clone().unwrap_or_default();
    framework
        .resources()
        .push(TestResource::PersistentVolumeClaim(name));
    Ok(claim)
}

/// A bound claim for one test case, dynamically provisioned or backed by a
/// volume the driver created.
pub struct VolumeResource {
    pub class: Option<StorageClass>,
    pub claim: PersistentVolumeClaim,
    pub pv: PersistentVolume,
    volume: Option<Box<dyn TestVolume>>,
}

impl VolumeResource {
    /// Wraps a claim that was provisioned from `class`.
    pub fn provisioned(class: StorageClass, claim: PersistentVolumeClaim, pv: PersistentVolume) -> Self {
        VolumeResource {
            class: Some(class),
            claim,
            pv,
            volume: None,
        }
    }

    pub async fn create(
        driver: &dyn TestDriver,
        config: &PerTestConfig,
        pattern: &TestPattern,
        framework: &mut Framework,
    ) -> anyhow::Result<Self> {
        let claim_name = format!("{}-pvc", config.prefix);
        match pattern.vol_type {
            TestVolType::DynamicPV => {
                let dynamic = driver.as_dynamic_pv().ok_or_else(|| {
                    anyhow::anyhow!("{} cannot provision volumes", driver.driver_info().name)
                })?;
                let class = dynamic
                    .dynamic_provision_storage_class(config, pattern.fs_type)
                    .await?;
                let class = create_storage_class(framework, class).await?;
                let request = claim(
                    &claim_name,
                    class.metadata.name.as_deref(),
                    &dynamic.claim_size(),
                    pattern.vol_mode,
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
                Ok(VolumeResource::provisioned(class, claim, pv))
            }
            TestVolType::PreprovisionedPV => {
                let name = driver.driver_info().name.clone();
                let (creator, describer) = driver
                    .as_preprovisioned_volume()
                    .zip(driver.as_preprovisioned_pv())
                    .ok_or_else(|| anyhow::anyhow!("{} cannot pre-provision volumes", name))?;
                let volume = creator
                    .create_volume(framework, config, pattern.vol_type)
                    .await?;
                let bound = bind_preprovisioned(
                    describer,
                    volume.as_ref(),
                    config,
                    pattern,
                    &claim_name,
                    framework,
                )
                .await;
                let (claim, pv) =
                    release_after_failure(bound, volume.delete_volume(framework)).await?;
                Ok(VolumeResource {
                    class: None,
                    claim,
                    pv,
                    volume: Some(volume),
                })
            }
            TestVolType::InlineVolume => {
                anyhow::bail!("inline volumes are not supported for {}", pattern.name)
            }
        }
    }

    pub fn claim_name(&self) -> &str {
        self.claim.metadata.name.as_deref().unwrap_or_default()
    }

    /// Deletes the claim, waits for a provisioned volume to go away and
    /// deletes a pre-provisioned one through the driver.
    pub async fn clean_up(self, framework: &Framework) -> anyhow::Result<()> {
        let claims: Api<PersistentVolumeClaim> =
            Api::namespaced(framework.client(), framework.namespace());
        match claims.delete(self.claim_name(), &Default::default()).await {
            Err(e) if !is_not_found(&e) => return Err(e.into()),
            _ => (),
        }

        let pv_name = self.pv.metadata.name.clone().unwrap_or_default();
        match self.volume {
            Some(volume) => {
                let pvs: Api<PersistentVolume> = Api::all(framework.client());
                match pvs.delete(&pv_name, &Default::default()).await {
                    Err(e) if !is_not_found(&e) => return Err(e.into()),
                    _ => (),
                }
                wait_for_pv_deleted(framework.client(), &pv_name, PV_DELETE_POLL, PV_DELETE_TIMEOUT)
                    .await?;
                volume.delete_volume(framework).await
            }
            None if reclaim_policy(&self.pv) == "Delete" => {
                wait_for_pv_deleted(framework.client(), &pv_name, PV_DELETE_POLL, PV_DELETE_TIMEOUT)
                    .await
            }
            None => Ok(()),
        }
    }
}

/// Wraps a volume the driver created in a PersistentVolume and binds a claim
/// to it.
async fn bind_preprovisioned(
    describer: &dyn PreprovisionedPvTestDriver,
    volume: &dyn TestVolume,
    config: &PerTestConfig,
    pattern: &TestPattern,
    claim_name: &str,
    framework: &mut Framework,
) -> anyhow::Result<(PersistentVolumeClaim, PersistentVolume)> {
    let (source, affinity) = describer.persistent_volume_source(false, pattern.fs_type, volume);

    let pv_name = format!("{}-{}", config.prefix, config.unique_name);
    let pv = preprovisioned_pv(
        &pv_name,
        source,
        affinity,
        DEFAULT_CLAIM_SIZE,
        pattern.vol_mode,
    )?;
    let pvs: Api<PersistentVolume> = Api::all(framework.client());
    pvs.create(&PostParams::default(), &pv).await?;
    framework
        .resources()
        .push(TestResource::PersistentVolume(pv_name.clone()));

    let request = claim(
        claim_name,
        None,
        DEFAULT_CLAIM_SIZE,
        pattern.vol_mode,
        Some(&pv_name),
    )?;
    create_claim(framework, &request).await?;
    wait_for_pvc_bound(
        framework.client(),
        framework.namespace(),
        claim_name,
        CLAIM_PROVISION_TIMEOUT,
    )
    .await
}

/// Runs `delete` when `result` is an error. The error is returned unchanged,
/// a failed deletion is only logged.
pub async fn release_after_failure<T, D>(result: anyhow::Result<T>, delete: D) -> anyhow::Result<T>
where
    D: Future<Output = anyhow::Result<()>>,
{
    if let Err(e) = &result {
        warn!(error = %e, "Volume setup failed, deleting the created volume");
        if let Err(delete_error) = delete.await {
            warn!(error = %delete_error, "Unable to delete volume after failed setup");
        }
    }
    result
}

pub fn reclaim_policy(pv: &PersistentVolume) -> &str {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
        .unwrap_or("Delete")
}
