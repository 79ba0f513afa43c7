//! Volume IO: files of every size up to the driver's limit are written to
//! the volume, read back and compared.
use tracing::info;

use super::resource::VolumeResource;
use super::{TestSuite, TestSuiteInfo};
use crate::framework::pod::{run_in_pod_with_volume, TEST_MOUNT_PATH};
use crate::framework::Framework;
use crate::pattern::{
    FileSize, TestPattern, DEFAULT_FS_DYNAMIC_PV, DEFAULT_FS_INLINE_VOLUME,
    DEFAULT_FS_PREPROVISIONED_PV,
};
use crate::testdriver::{PerTestConfig, TestDriver};

pub const WRITE_FILES: &str = "should write files of various sizes, verify size, validate content";

const CASES: &[&str] = &[WRITE_FILES];

/// Repeated to fill the test files.
const FILL_PATTERN: &str = "csi-certify";

pub struct VolumeIoTestSuite {
    info: TestSuiteInfo,
}

impl VolumeIoTestSuite {
    pub fn new() -> Self {
        VolumeIoTestSuite {
            info: TestSuiteInfo {
                name: "volumeIO",
                patterns: vec![
                    DEFAULT_FS_INLINE_VOLUME,
                    DEFAULT_FS_PREPROVISIONED_PV,
                    DEFAULT_FS_DYNAMIC_PV,
                ],
            },
        }
    }
}

impl Default for VolumeIoTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes a file of `size`, checks its length and compares it with freshly
/// generated content before removing it.
fn file_io_command(size: FileSize) -> String {
    let bytes = size.bytes();
    let file = format!("{}/{}-{}", TEST_MOUNT_PATH, FILL_PATTERN, bytes);
    format!(
        "yes '{fill}' | head -c {bytes} > {file} && \
         test \"$(stat -c %s {file})\" = {bytes} && \
         yes '{fill}' | head -c {bytes} | cmp -s - {file} && \
         rm {file}",
        fill = FILL_PATTERN,
        bytes = bytes,
        file = file
    )
}

fn volume_io_command(max: FileSize) -> String {
    max.up_to()
        .into_iter()
        .map(file_io_command)
        .collect::<Vec<_>>()
        .join(" && ")
}

#[async_trait::async_trait]
impl TestSuite for VolumeIoTestSuite {
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
        if case != WRITE_FILES {
            anyhow::bail!("volumeIO has no case {:?}", case);
        }
        let max = driver.driver_info().max_file_size;
        let resource = VolumeResource::create(driver, config, pattern, framework).await?;
        let claim_name = resource.claim_name().to_owned();

        info!(claim = %claim_name, ?max, "Writing files up to the driver's maximum size");
        let result = run_in_pod_with_volume(
            framework,
            &claim_name,
            "volume-io-client",
            &volume_io_command(max),
            config.client_node_name.as_deref(),
        )
        .await;

        let cleaned = resource.clean_up(framework).await;
        result.and(cleaned)
    }
}
