//! Snapshots: a dynamically provisioned volume can be snapshotted through
//! the driver's VolumeSnapshotClass.
use std::time::Duration;

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::resource::VolumeResource;
use super::{TestSuite, TestSuiteInfo};
use crate::applicability::Skip;
use crate::framework::deploy::create_item;
use crate::framework::pod::{run_in_pod_with_volume, TEST_MOUNT_PATH};
use crate::framework::Framework;
use crate::pattern::{TestPattern, DYNAMIC_SNAPSHOT};
use crate::storage_class::{SNAPSHOT_GROUP, SNAPSHOT_VERSION};
use crate::testdriver::{PerTestConfig, TestDriver};

pub const CREATE_SNAPSHOT: &str = "should create snapshot with defaults";

const CASES: &[&str] = &[CREATE_SNAPSHOT];

/// How long a snapshot may take to become ready to use.
const SNAPSHOT_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const SNAPSHOT_POLL: Duration = Duration::from_secs(2);

pub struct SnapshottableTestSuite {
    info: TestSuiteInfo,
}

impl SnapshottableTestSuite {
    pub fn new() -> Self {
        SnapshottableTestSuite {
            info: TestSuiteInfo {
                name: "snapshottable",
                patterns: vec![DYNAMIC_SNAPSHOT],
            },
        }
    }
}

impl Default for SnapshottableTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// A VolumeSnapshot of `claim_name` taken with `class_name`.
pub fn volume_snapshot(name: &str, class_name: &str, claim_name: &str) -> Value {
    json!({
        "apiVersion": format!("{}/{}", SNAPSHOT_GROUP, SNAPSHOT_VERSION),
        "kind": "VolumeSnapshot",
        "metadata": {
            "name": name,
        },
        "spec": {
            "volumeSnapshotClassName": class_name,
            "source": {
                "persistentVolumeClaimName": claim_name,
            },
        },
    })
}

fn snapshot_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(SNAPSHOT_GROUP, SNAPSHOT_VERSION, kind))
}

/// The bound content's name once the snapshot is ready to use. A snapshot
/// that reports an error fails at once.
fn ready_snapshot(snapshot: &DynamicObject) -> anyhow::Result<Option<String>> {
    let status = &snapshot.data["status"];
    if let Some(message) = status["error"]["message"].as_str() {
        anyhow::bail!(
            "snapshot {} failed: {}",
            snapshot.metadata.name.as_deref().unwrap_or_default(),
            message
        );
    }
    if status["readyToUse"].as_bool() != Some(true) {
        return Ok(None);
    }
    Ok(status["boundVolumeSnapshotContentName"]
        .as_str()
        .map(str::to_owned))
}

async fn wait_for_snapshot_ready(
    framework: &Framework,
    name: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let api: Api<DynamicObject> = Api::namespaced_with(
        framework.client(),
        framework.namespace(),
        &snapshot_resource("VolumeSnapshot"),
    );
    let poll = async {
        loop {
            let snapshot = api.get(name).await?;
            if let Some(content) = ready_snapshot(&snapshot)? {
                return Ok::<_, anyhow::Error>(content);
            }
            debug!(snapshot = name, "Waiting for snapshot to become ready");
            tokio::time::sleep(SNAPSHOT_POLL).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| anyhow::anyhow!("snapshot {} not ready within {:?}", name, timeout))?
}

#[async_trait::async_trait]
impl TestSuite for SnapshottableTestSuite {
    fn info(&self) -> &TestSuiteInfo {
        &self.info
    }

    fn case_names(&self) -> &'static [&'static str] {
        CASES
    }

    fn skip_unsupported(
        &self,
        _case: &str,
        driver: &dyn TestDriver,
        _pattern: &TestPattern,
    ) -> Result<(), Skip> {
        match driver.as_snapshottable() {
            Some(_) => Ok(()),
            None => Err(Skip::new(format!(
                "Driver {} doesn't support snapshots -- skipping",
                driver.driver_info().name
            ))),
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
        if case != CREATE_SNAPSHOT {
            anyhow::bail!("snapshottable has no case {:?}", case);
        }
        let snapshottable = driver.as_snapshottable().ok_or_else(|| {
            anyhow::anyhow!("{} cannot take snapshots", driver.driver_info().name)
        })?;
        let class = snapshottable.snapshot_class(config)?;
        let class_name = class.metadata.name.clone().unwrap_or_default();

        let resource = VolumeResource::create(driver, config, pattern, framework).await?;
        let claim_name = resource.claim_name().to_owned();
        let result = take_snapshot(framework, config, class, &class_name, &claim_name).await;
        let cleaned = resource.clean_up(framework).await;
        result.and(cleaned)
    }
}

async fn take_snapshot(
    framework: &mut Framework,
    config: &PerTestConfig,
    class: DynamicObject,
    class_name: &str,
    claim_name: &str,
) -> anyhow::Result<()> {
    run_in_pod_with_volume(
        framework,
        claim_name,
        "snapshot-source-writer",
        &format!("echo 'snapshot source' > {}/data && sync", TEST_MOUNT_PATH),
        config.client_node_name.as_deref(),
    )
    .await?;

    info!(class = class_name, "Creating snapshot class");
    create_item(framework, serde_json::to_value(&class)?).await?;

    let snapshot_name = format!("{}-snapshot", config.prefix);
    info!(snapshot = %snapshot_name, claim = claim_name, "Creating snapshot");
    create_item(
        framework,
        volume_snapshot(&snapshot_name, class_name, claim_name),
    )
    .await?;

    let content =
        wait_for_snapshot_ready(framework, &snapshot_name, SNAPSHOT_READY_TIMEOUT).await?;
    let contents: Api<DynamicObject> =
        Api::all_with(framework.client(), &snapshot_resource("VolumeSnapshotContent"));
    let content = contents.get(&content).await?;
    let bound_to = content.data["spec"]["volumeSnapshotRef"]["name"]
        .as_str()
        .unwrap_or_default();
    if bound_to != snapshot_name {
        anyhow::bail!(
            "snapshot content {} is bound to {:?}, not {}",
            content.metadata.name.as_deref().unwrap_or_default(),
            bound_to,
            snapshot_name
        );
    }
    info!(snapshot = %snapshot_name, "Snapshot is ready to use");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn snapshot(status: Value) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1",
            "kind": "VolumeSnapshot",
            "metadata": {"name": "snap"},
            "status": status,
        }))
        .unwrap()
    }

    #[test]
    fn snapshot_points_at_class_and_claim() {
        let object = volume_snapshot("hostpath-snapshot", "ns-hostpath-vsc", "hostpath-pvc");
        assert_eq!(object["apiVersion"], "snapshot.storage.k8s.io/v1");
        assert_eq!(object["spec"]["volumeSnapshotClassName"], "ns-hostpath-vsc");
        assert_eq!(
            object["spec"]["source"]["persistentVolumeClaimName"],
            "hostpath-pvc"
        );
    }

    #[test]
    fn snapshot_is_ready_with_bound_content() {
        let pending = snapshot(json!({"readyToUse": false}));
        assert_eq!(ready_snapshot(&pending).unwrap(), None);

        let ready = snapshot(json!({
            "readyToUse": true,
            "boundVolumeSnapshotContentName": "snapcontent-1"
        }));
        assert_eq!(
            ready_snapshot(&ready).unwrap().as_deref(),
            Some("snapcontent-1")
        );

        let failed = snapshot(json!({"error": {"message": "driver refused"}}));
        let error = ready_snapshot(&failed).unwrap_err();
        assert_eq!(error.to_string(), "snapshot snap failed: driver refused");
    }

    #[test]
    fn only_the_dynamic_snapshot_pattern() {
        let suite = SnapshottableTestSuite::new();
        assert_eq!(suite.info().patterns, vec![DYNAMIC_SNAPSHOT]);
    }
}
