//! Volume modes: filesystem and raw block volumes can both be provisioned,
//! written and read through a pod, and cleaned up again.
use tracing::info;
use uuid::Uuid;

use super::resource::VolumeResource;
use super::{TestSuite, TestSuiteInfo};
use crate::framework::pod::{run_in_pod_using, VolumeUse, TEST_DEVICE_PATH, TEST_MOUNT_PATH};
use crate::framework::Framework;
use crate::pattern::{
    TestPattern, TestVolMode, BLOCK_VOL_MODE_DYNAMIC_PV, BLOCK_VOL_MODE_PREPROVISIONED_PV,
    DEFAULT_FS_DYNAMIC_PV, DEFAULT_FS_PREPROVISIONED_PV,
};
use crate::testdriver::{PerTestConfig, TestDriver};

pub const READ_WRITE: &str =
    "should create sc, pod, pv, and pvc, read/write to the pv, and delete all created resources";

const CASES: &[&str] = &[READ_WRITE];

pub struct VolumeModeTestSuite {
    info: TestSuiteInfo,
}

impl VolumeModeTestSuite {
    pub fn new() -> Self {
        VolumeModeTestSuite {
            info: TestSuiteInfo {
                name: "volumeMode",
                patterns: vec![
                    DEFAULT_FS_PREPROVISIONED_PV,
                    DEFAULT_FS_DYNAMIC_PV,
                    BLOCK_VOL_MODE_PREPROVISIONED_PV,
                    BLOCK_VOL_MODE_DYNAMIC_PV,
                ],
            },
        }
    }
}

impl Default for VolumeModeTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// The write and read commands for `content` in the given mode. Block
/// volumes are written through the raw device.
fn read_write_commands(mode: TestVolMode, content: &str) -> (String, String) {
    match mode {
        TestVolMode::Block => (
            format!(
                "echo '{}' | dd of={} bs=512 count=1 conv=fsync",
                content, TEST_DEVICE_PATH
            ),
            format!(
                "dd if={} bs=512 count=1 | grep -q '{}'",
                TEST_DEVICE_PATH, content
            ),
        ),
        TestVolMode::Filesystem => {
            let file = format!("{}/volume-mode-data", TEST_MOUNT_PATH);
            (
                format!("echo '{}' > {} && sync", content, file),
                format!("grep -q '{}' {}", content, file),
            )
        }
    }
}

#[async_trait::async_trait]
impl TestSuite for VolumeModeTestSuite {
    fn info(&self) -> &TestSuiteInfo {
        &self.info
    }

    fn case_names(&self) -> &'static [&'static str] {
        CASES
    }

    async fn run_case(
        &self,
        case: &str,
        driver: &dyn TestDriver,
        config: &PerTestConfig,
        pattern: &TestPattern,
        framework: &mut Framework,
    ) -> anyhow::Result<()> {
        if case != READ_WRITE {
            anyhow::bail!("volumeMode has no case {:?}", case);
        }
        let resource = VolumeResource::create(driver, config, pattern, framework).await?;
        let claim_name = resource.claim_name().to_owned();
        let node = config.client_node_name.as_deref();
        let usage = VolumeUse {
            mode: pattern.vol_mode,
            sub_path: None,
        };

        let content = format!("volume mode {}", Uuid::new_v4());
        let (write, read) = read_write_commands(pattern.vol_mode, &content);
        info!(claim = %claim_name, mode = pattern.vol_mode.as_str(), "Writing through the volume");
        let mut result =
            run_in_pod_using(framework, &claim_name, "volume-mode-writer", &write, node, usage).await;
        if result.is_ok() {
            info!(claim = %claim_name, "Reading back from a second pod");
            result =
                run_in_pod_using(framework, &claim_name, "volume-mode-reader", &read, node, usage)
                    .await;
        }

        let cleaned = resource.clean_up(framework).await;
        result.and(cleaned)
    }
}
