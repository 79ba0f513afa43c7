//! Runs expanded test cases one after another against a cluster and collects
//! the outcome of each.
use std::fmt;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{error, info, warn};

use crate::applicability::{skip_unsupported_test, Skip};
use crate::framework::Framework;
use crate::manifest::ManifestSource;
use crate::suites::TestCase;
use crate::testdriver::TestDriver;

/// Selects cases by name. A case runs when it matches `focus` (if given) and
/// does not match `skip` (if given).
#[derive(Clone, Debug, Default)]
pub struct CaseFilter {
    focus: Option<Regex>,
    skip: Option<Regex>,
}

impl CaseFilter {
    pub fn new(focus: Option<&str>, skip: Option<&str>) -> Result<Self, regex::Error> {
        Ok(CaseFilter::from_regexes(
            focus.map(Regex::new).transpose()?,
            skip.map(Regex::new).transpose()?,
        ))
    }

    pub fn from_regexes(focus: Option<Regex>, skip: Option<Regex>) -> Self {
        CaseFilter { focus, skip }
    }

    pub fn selects(&self, name: &str) -> bool {
        self.focus.as_ref().map(|r| r.is_match(name)).unwrap_or(true)
            && !self.skip.as_ref().map(|r| r.is_match(name)).unwrap_or(false)
    }
}

/// Whether a case applies to the driver: the generic checks, then the
/// suite's own requirements for the case.
pub fn check_case(driver: &dyn TestDriver, case: &TestCase) -> Result<(), Skip> {
    skip_unsupported_test(driver, &case.pattern)?;
    case.suite.skip_unsupported(case.case, driver, &case.pattern)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Passed,
    Skipped(String),
    Failed(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Passed => f.write_str("PASSED"),
            Outcome::Skipped(reason) => write!(f, "SKIPPED: {}", reason),
            Outcome::Failed(reason) => write!(f, "FAILED: {}", reason),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaseResult {
    pub name: String,
    pub outcome: Outcome,
    pub duration: Duration,
}

/// The results of a run. Cases removed by the filter are only counted.
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub results: Vec<CaseResult>,
    pub filtered: usize,
}

impl Report {
    fn count(&self, f: impl Fn(&Outcome) -> bool) -> usize {
        self.results.iter().filter(|r| f(&r.outcome)).count()
    }

    pub fn passed(&self) -> usize {
        self.count(|o| *o == Outcome::Passed)
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed(_)))
    }

    /// True when no case failed. The process exit code follows this.
    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    /// Appends the results of another driver's run.
    pub fn merge(&mut self, other: Report) {
        self.results.extend(other.results);
        self.filtered += other.filtered;
    }

    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for result in self.failures() {
            writeln!(f, "[Fail] {}", result.name)?;
        }
        write!(
            f,
            "Ran {} of {} cases: {} Passed | {} Failed | {} Skipped",
            self.passed() + self.failed(),
            self.results.len() + self.filtered,
            self.passed(),
            self.failed(),
            self.skipped() + self.filtered,
        )
    }
}

/// Lists what a run would do without touching a cluster.
pub fn plan(driver: &dyn TestDriver, cases: &[TestCase], filter: &CaseFilter) -> Report {
    let mut report = Report::default();
    for case in cases {
        if !filter.selects(&case.name) {
            report.filtered += 1;
            continue;
        }
        let outcome = match check_case(driver, case) {
            Ok(()) => Outcome::Passed,
            Err(skip) => Outcome::Skipped(skip.reason),
        };
        report.results.push(CaseResult {
            name: case.name.clone(),
            outcome,
            duration: Duration::default(),
        });
    }
    report
}

pub struct Runner {
    client: kube::Client,
    driver: Box<dyn TestDriver>,
    manifests: ManifestSource,
    filter: CaseFilter,
}

impl Runner {
    pub fn new(
        client: kube::Client,
        driver: Box<dyn TestDriver>,
        manifests: ManifestSource,
        filter: CaseFilter,
    ) -> Self {
        Runner {
            client,
            driver,
            manifests,
            filter,
        }
    }

    pub fn driver(&self) -> &dyn TestDriver {
        self.driver.as_ref()
    }

    /// Runs every selected case in order.
    pub async fn run(&self, cases: &[TestCase]) -> Report {
        let mut report = Report::default();
        for case in cases {
            if !self.filter.selects(&case.name) {
                report.filtered += 1;
                continue;
            }
            let start = Instant::now();
            info!(case = %case.name, "Starting test case");
            let outcome = match check_case(self.driver(), case) {
                Err(skip) => Outcome::Skipped(skip.reason),
                Ok(()) => match self.run_case(case).await {
                    Ok(()) => Outcome::Passed,
                    Err(e) => Outcome::Failed(format!("{:#}", e)),
                },
            };
            match &outcome {
                Outcome::Passed => info!(case = %case.name, "Test case passed"),
                Outcome::Skipped(reason) => info!(case = %case.name, %reason, "Test case skipped"),
                Outcome::Failed(reason) => error!(case = %case.name, %reason, "Test case failed"),
            }
            report.results.push(CaseResult {
                name: case.name.clone(),
                outcome,
                duration: start.elapsed(),
            });
        }
        report
    }

    async fn run_case(&self, case: &TestCase) -> anyhow::Result<()> {
        let suite = case.suite.info().name;
        let mut framework =
            Framework::setup(self.client.clone(), suite, self.manifests.clone()).await?;
        let result = self.run_in_framework(case, &mut framework).await;
        if result.is_err() {
            warn!(namespace = framework.namespace(), "Tearing down after failure");
        }
        framework.teardown().await;
        result
    }

    async fn run_in_framework(
        &self,
        case: &TestCase,
        framework: &mut Framework,
    ) -> anyhow::Result<()> {
        let config = self.driver.prepare_test(framework).await?;
        case.suite
            .run_case(case.case, self.driver(), &config, &case.pattern, framework)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::driver::{DriverDefinition, DriverInfo, StorageClassSource};
    use crate::external::DefinitionDriver;
    use crate::suites::{csi_test_suites, define_test_suite};

    fn from_name_driver() -> DefinitionDriver {
        DefinitionDriver::new(DriverDefinition {
            driver_info: DriverInfo::named("hostpath.csi.k8s.io"),
            storage_class: StorageClassSource {
                from_name: true,
                from_file: None,
            },
            ..Default::default()
        })
    }

    #[test]
    fn filter_focus_and_skip() {
        let filter = CaseFilter::new(Some("provisioning"), Some("block")).unwrap();
        assert!(filter.selects("[Testpattern: Dynamic PV (default fs)] provisioning should provision storage with defaults"));
        assert!(!filter.selects("provisioning should create and delete block persistent volumes"));
        assert!(!filter.selects("volumes should store data"));
        assert!(CaseFilter::default().selects("anything"));
        assert!(CaseFilter::new(Some("("), None).is_err());
    }

    #[test]
    fn plan_reports_verdicts_for_selected_cases() {
        let driver = from_name_driver();
        let cases = define_test_suite(&driver, &csi_test_suites());
        let filter = CaseFilter::new(Some(r"Dynamic PV \(default fs\)"), None).unwrap();
        let report = plan(&driver, &cases, &filter);

        assert_eq!(report.results.len() + report.filtered, cases.len());
        let defaults = report
            .results
            .iter()
            .find(|r| r.name.ends_with("provisioning should provision storage with defaults"))
            .unwrap();
        assert_eq!(defaults.outcome, Outcome::Passed);
        // The definition declares no persistence capability.
        let store = report
            .results
            .iter()
            .find(|r| r.name.ends_with("volumes should store data"))
            .unwrap();
        assert_eq!(
            store.outcome,
            Outcome::Skipped("Driver hostpath.csi.k8s.io does not provide persistence -- skipping".into())
        );
        assert!(report.success());
    }

    #[test]
    fn merged_reports_add_up() {
        let driver = from_name_driver();
        let cases = define_test_suite(&driver, &csi_test_suites());
        let focused = CaseFilter::new(Some("provisioning"), None).unwrap();
        let mut report = plan(&driver, &cases, &focused);
        let first = report.results.len();
        report.merge(plan(&driver, &cases, &CaseFilter::default()));
        assert_eq!(report.results.len(), first + cases.len());
        assert_eq!(report.filtered, cases.len() - first);
    }

    #[test]
    fn report_summary_counts_outcomes() {
        let report = Report {
            results: vec![
                CaseResult {
                    name: "a".into(),
                    outcome: Outcome::Passed,
                    duration: Duration::default(),
                },
                CaseResult {
                    name: "b".into(),
                    outcome: Outcome::Failed("boom".into()),
                    duration: Duration::default(),
                },
                CaseResult {
                    name: "c".into(),
                    outcome: Outcome::Skipped("nope".into()),
                    duration: Duration::default(),
                },
            ],
            filtered: 2,
        };
        assert!(!report.success());
        assert_eq!(
            report.to_string(),
            "[Fail] b\nRan 2 of 5 cases: 1 Passed | 1 Failed | 3 Skipped"
        );
    }
}
