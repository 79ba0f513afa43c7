//! Generic storage test suites and their expansion into test cases.
//!
//! A suite is a set of named case bodies parameterized by [`TestPattern`]s.
//! [`define_test_suite`] crosses every suite with the patterns the driver
//! keeps after tuning and with the suite's case names; the runner decides per
//! case whether it applies to the driver.
use std::sync::Arc;

use crate::applicability::Skip;
use crate::framework::Framework;
use crate::pattern::TestPattern;
use crate::testdriver::{PerTestConfig, TestDriver};

pub mod provisioning;
pub mod resource;
pub mod snapshottable;
pub mod subpath;
pub mod volume_io;
pub mod volume_mode;
pub mod volumes;

pub use provisioning::ProvisioningTestSuite;
pub use snapshottable::SnapshottableTestSuite;
pub use subpath::SubPathTestSuite;
pub use volume_io::VolumeIoTestSuite;
pub use volume_mode::VolumeModeTestSuite;
pub use volumes::VolumesTestSuite;

/// The name and patterns of a suite.
#[derive(Clone, Debug)]
pub struct TestSuiteInfo {
    pub name: &'static str,
    pub patterns: Vec<TestPattern>,
}

#[async_trait::async_trait]
pub trait TestSuite: Send + Sync {
    fn info(&self) -> &TestSuiteInfo;

    fn case_names(&self) -> &'static [&'static str];

    /// Case specific requirements, checked after the generic applicability
    /// checks and before any cluster object is created.
    fn skip_unsupported(
        &self,
        _case: &str,
        _driver: &dyn TestDriver,
        _pattern: &TestPattern,
    ) -> Result<(), Skip> {
        Ok(())
    }

    async fn run_case(
        &self,
        case: &str,
        driver: &dyn TestDriver,
        config: &PerTestConfig,
        pattern: &TestPattern,
        framework: &mut Framework,
    ) -> anyhow::Result<()>;
}

/// The suites every driver is tested with.
pub fn csi_test_suites() -> Vec<Arc<dyn TestSuite>> {
    vec![
        Arc::new(VolumesTestSuite::new()),
        Arc::new(VolumeIoTestSuite::new()),
        Arc::new(VolumeModeTestSuite::new()),
        Arc::new(SubPathTestSuite::new()),
        Arc::new(ProvisioningTestSuite::new()),
        Arc::new(SnapshottableTestSuite::new()),
    ]
}

/// One expanded test case.
#[derive(Clone)]
pub struct TestCase {
    pub name: String,
    pub suite: Arc<dyn TestSuite>,
    pub case: &'static str,
    pub pattern: TestPattern,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase").field("name", &self.name).finish()
    }
}

/// `External Storage [Driver: <name>]<tag> [Testpattern: <pattern>] <suite> <case>`
pub fn test_case_name(
    driver: &dyn TestDriver,
    pattern: &TestPattern,
    suite: &str,
    case: &str,
) -> String {
    format!(
        "External Storage {} {} {} {}",
        driver.driver_info().name_with_feature_tags(),
        pattern,
        suite,
        case
    )
}

pub fn define_test_suite(driver: &dyn TestDriver, suites: &[Arc<dyn TestSuite>]) -> Vec<TestCase> {
    let mut cases = Vec::new();
    for suite in suites {
        let info = suite.info();
        for pattern in driver.tune_patterns(&info.patterns) {
            for case in suite.case_names().iter().copied() {
                cases.push(TestCase {
                    name: test_case_name(driver, &pattern, info.name, case),
                    suite: Arc::clone(suite),
                    case,
                    pattern: pattern.clone(),
                });
            }
        }
    }
    cases
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::DriverInfo;
    use crate::pattern::*;

    struct TaggedDriver {
        info: DriverInfo,
        tune: bool,
    }

    #[async_trait::async_trait]
    impl TestDriver for TaggedDriver {
        fn driver_info(&self) -> &DriverInfo {
            &self.info
        }

        fn skip_unsupported_test(&self, _pattern: &TestPattern) -> Result<(), Skip> {
            Ok(())
        }

        async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig> {
            Ok(PerTestConfig::new("tagged", framework))
        }

        fn tune_patterns(&self, patterns: &[TestPattern]) -> Vec<TestPattern> {
            if self.tune {
                csi_tune_pattern(patterns)
            } else {
                patterns.to_vec()
            }
        }
    }

    fn driver(tune: bool) -> TaggedDriver {
        let mut info = DriverInfo::named("example.csi.io");
        info.feature_tag = "[Feature:Example]".to_owned();
        TaggedDriver { info, tune }
    }

    #[test]
    fn cases_are_named_after_driver_pattern_suite_and_case() {
        let cases = define_test_suite(&driver(false), &csi_test_suites());
        assert_eq!(
            cases[0].name,
            "External Storage [Driver: example.csi.io][Feature:Example] \
             [Testpattern: Inline-volume (default fs)] volumes should store data"
        );
        assert!(cases.iter().any(|c| c.name
            == "External Storage [Driver: example.csi.io][Feature:Example] \
                [Testpattern: Dynamic PV (default fs)] provisioning should provision storage with defaults"));
    }

    #[test]
    fn every_generic_suite_is_registered() {
        let names: Vec<_> = csi_test_suites().iter().map(|s| s.info().name).collect();
        assert_eq!(
            names,
            vec![
                "volumes",
                "volumeIO",
                "volumeMode",
                "subPath",
                "provisioning",
                "snapshottable"
            ]
        );
        let cases = define_test_suite(&driver(false), &csi_test_suites());
        assert!(cases.iter().any(|c| c.name
            == "External Storage [Driver: example.csi.io][Feature:Example] \
                [Testpattern: Pre-provisioned PV (default fs)] subPath should support existing directory"));
        assert!(cases.iter().any(|c| c.name
            == "External Storage [Driver: example.csi.io][Feature:Example] \
                [Testpattern: Dynamic Snapshot] snapshottable should create snapshot with defaults"));
    }

    #[test]
    fn suites_times_patterns_times_cases() {
        let suites = csi_test_suites();
        let expected: usize = suites
            .iter()
            .map(|s| s.info().patterns.len() * s.case_names().len())
            .sum();
        assert_eq!(define_test_suite(&driver(false), &suites).len(), expected);
    }

    #[test]
    fn tuned_patterns_drop_cases() {
        let cases = define_test_suite(&driver(true), &csi_test_suites());
        assert!(cases
            .iter()
            .all(|c| c.pattern.vol_type == TestVolType::DynamicPV));
        assert!(!cases.is_empty());
    }
}
