//! Sub paths: a pod can mount a directory or file inside the volume instead
//! of its root, and kubelet refuses sub paths that leave the volume.
use std::time::Duration;

use tracing::info;

use super::resource::VolumeResource;
use super::{TestSuite, TestSuiteInfo};
use crate::framework::pod::{
    run_in_pod_expecting_no_start, run_in_pod_using, run_in_pod_with_volume, VolumeUse,
    TEST_MOUNT_PATH,
};
use crate::framework::Framework;
use crate::pattern::{
    TestPattern, DEFAULT_FS_DYNAMIC_PV, DEFAULT_FS_INLINE_VOLUME, DEFAULT_FS_PREPROVISIONED_PV,
};
use crate::testdriver::{PerTestConfig, TestDriver};

pub const NON_EXISTENT_PATH: &str = "should support non-existent path";
pub const EXISTING_DIRECTORY: &str = "should support existing directory";
pub const EXISTING_FILE: &str = "should support existing single file";
pub const OUTSIDE_VOLUME: &str = "should fail if subpath directory is outside the volume";

const CASES: &[&str] = &[
    NON_EXISTENT_PATH,
    EXISTING_DIRECTORY,
    EXISTING_FILE,
    OUTSIDE_VOLUME,
];

/// The sub path inside the volume every case mounts.
const SUB_PATH: &str = "provisioning";
const SUB_PATH_FILE: &str = "provisioning/test-file";

/// How long a pod with an escaping sub path is watched.
const FAIL_WINDOW: Duration = Duration::from_secs(60);

pub struct SubPathTestSuite {
    info: TestSuiteInfo,
}

impl SubPathTestSuite {
    pub fn new() -> Self {
        SubPathTestSuite {
            info: TestSuiteInfo {
                name: "subPath",
                patterns: vec![
                    DEFAULT_FS_INLINE_VOLUME,
                    DEFAULT_FS_PREPROVISIONED_PV,
                    DEFAULT_FS_DYNAMIC_PV,
                ],
            },
        }
    }
}

impl Default for SubPathTestSuite {
    fn default() -> Self {
        Self::new()
    }
}

/// What a case does before the sub path pod starts, run with the volume root
/// mounted. `None` when the sub path must not exist yet.
fn prepare_command(case: &str) -> Option<String> {
    let dir = format!("{}/{}", TEST_MOUNT_PATH, SUB_PATH);
    match case {
        EXISTING_DIRECTORY => Some(format!("mkdir -p {}", dir)),
        EXISTING_FILE => Some(format!(
            "mkdir -p {dir} && echo 'mount-tester new file' > {}/{}",
            TEST_MOUNT_PATH,
            SUB_PATH_FILE,
            dir = dir
        )),
        OUTSIDE_VOLUME => Some(format!("ln -s /bin {}", dir)),
        _ => None,
    }
}

/// The sub path the test pod mounts and the command it runs there.
fn sub_path_command(case: &str) -> (&'static str, String) {
    match case {
        EXISTING_FILE => (
            SUB_PATH_FILE,
            format!("grep -q 'mount-tester new file' {}", TEST_MOUNT_PATH),
        ),
        _ => {
            let file = format!("{}/sub-path-data", TEST_MOUNT_PATH);
            (
                SUB_PATH,
                format!("echo 'sub path data' > {file} && grep -q 'sub path data' {file}", file = file),
            )
        }
    }
}

#[async_trait::async_trait]
impl TestSuite for SubPathTestSuite {
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
        if !CASES.contains(&case) {
            anyhow::bail!("subPath has no case {:?}", case);
        }
        let resource = VolumeResource::create(driver, config, pattern, framework).await?;
        let claim_name = resource.claim_name().to_owned();
        let result = run_sub_path_case(case, &claim_name, config, framework).await;
        let cleaned = resource.clean_up(framework).await;
        result.and(cleaned)
    }
}

async fn run_sub_path_case(
    case: &str,
    claim_name: &str,
    config: &PerTestConfig,
    framework: &mut Framework,
) -> anyhow::Result<()> {
    let node = config.client_node_name.as_deref();
    if let Some(prepare) = prepare_command(case) {
        info!(claim = claim_name, "Preparing the volume root");
        run_in_pod_with_volume(framework, claim_name, "sub-path-prepare", &prepare, node).await?;
    }

    let (sub_path, command) = sub_path_command(case);
    let usage = VolumeUse {
        sub_path: Some(sub_path),
        ..Default::default()
    };
    info!(claim = claim_name, sub_path, "Starting pod on the sub path");
    if case == OUTSIDE_VOLUME {
        run_in_pod_expecting_no_start(
            framework,
            claim_name,
            "sub-path-tester",
            &command,
            node,
            usage,
            FAIL_WINDOW,
        )
        .await
    } else {
        run_in_pod_using(framework, claim_name, "sub-path-tester", &command, node, usage).await
    }
}
