//! Volumes hold data across pods and, where the driver allows it, run the
//! files stored on them.
use tracing::info;
use uuid::Uuid;

use super::resource::VolumeResource;
use super::{TestSuite, TestSuiteInfo};
use crate::applicability::Skip;
use crate::driver::Capability;
use crate::framework::pod::{run_in_pod_with_volume, TEST_MOUNT_PATH};
use crate::framework::Framework;
use crate::pattern::{
    TestPattern, DEFAULT_FS_DYNAMIC_PV, DEFAULT_FS_INLINE_VOLUME, DEFAULT_FS_PREPROVISIONED_PV,
    EXT4_DYNAMIC_PV, XFS_DYNAMIC_PV,
};
use crate::testdriver::{PerTestConfig, TestDriver};

pub const STORE_DATA: &str = "should store data";
pub const EXEC_FILES: &str = "should allow exec of files on the volume";

const CASES: &[&str] = &[STORE_DATA, EXEC_FILES];

pub struct VolumesTestSuite {
    info: TestSuiteInfo,
}

impl VolumesTestSuite {
    pub fn new() -> Self {
        VolumesTestSuite {
            info: TestSuiteInfo {
                name: "volumes",
                patterns: vec![
                    DEFAULT_FS_INLINE_VOLUME,
                    DEFAULT_FS_PREPROVISIONED_PV,
                    DEFAULT_FS_DYNAMIC_PV,
                    EXT4_DYNAMIC_PV,
                    XFS_DYNAMIC_PV,
                ],
            },
        }
    }
}

impl Default for VolumesTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `content` to a file in one pod and looks for it from a second one.
fn store_data_commands(content: &str) -> (String, String) {
    let file = format!("{}/index.html", TEST_MOUNT_PATH);
    (
        format!("echo '{}' > {}", content, file),
        format!("grep -q '{}' {}", content, file),
    )
}

fn exec_command() -> String {
    let file = format!("{}/exec-test.sh", TEST_MOUNT_PATH);
    format!(
        "printf '#!/bin/sh\\necho Hello from the volume\\n' > {file} && chmod o+rx {file} && {file}",
        file = file
    )
}

#[async_trait::async_trait]
impl TestSuite for VolumesTestSuite {
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
            STORE_DATA if !info.has_capability(Capability::Persistence) => Err(Skip::new(format!(
                "Driver {} does not provide persistence -- skipping",
                info.name
            ))),
            EXEC_FILES if !info.has_capability(Capability::Exec) => Err(Skip::new(format!(
                "Driver {} does not support exec -- skipping",
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
        let resource = VolumeResource::create(driver, config, pattern, framework).await?;
        let claim_name = resource.claim_name().to_owned();
        let node = config.client_node_name.as_deref();

        let result = match case {
            STORE_DATA => {
                let content = format!("Hello from {}", Uuid::new_v4());
                let (write, read) = store_data_commands(&content);
                info!(claim = %claim_name, "Writing test data");
                match run_in_pod_with_volume(framework, &claim_name, "volume-writer", &write, node)
                    .await
                {
                    Ok(()) => {
                        info!(claim = %claim_name, "Reading test data from a second pod");
                        run_in_pod_with_volume(framework, &claim_name, "volume-reader", &read, node)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
            EXEC_FILES => {
                run_in_pod_with_volume(framework, &claim_name, "exec-volume-test", &exec_command(), node)
                    .await
            }
            other => Err(anyhow::anyhow!("volumes has no case {:?}", other)),
        };

        let cleaned = resource.clean_up(framework).await;
        result.and(cleaned)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reader_looks_for_what_the_writer_wrote() {
        let (write, read) = store_data_commands("Hello from namespace ns1");
        assert_eq!(write, "echo 'Hello from namespace ns1' > /mnt/test/index.html");
        assert_eq!(read, "grep -q 'Hello from namespace ns1' /mnt/test/index.html");
    }

    #[test]
    fn exec_script_lives_on_the_volume() {
        let command = exec_command();
        assert!(command.starts_with("printf '#!/bin/sh\\necho Hello from the volume\\n' > /mnt/test/exec-test.sh"));
        assert!(command.ends_with("&& /mnt/test/exec-test.sh"));
    }

    #[test]
    fn first_pattern_and_case_are_stable() {
        let suite = VolumesTestSuite::new();
        assert_eq!(suite.info().patterns[0], DEFAULT_FS_INLINE_VOLUME);
        assert_eq!(suite.case_names()[0], STORE_DATA);
    }
}
