//! Configuration for a certification run
//!
//! Turn on the "cli" feature and use [`Config::new_from_flags`] to read the
//! configuration from command line flags and `CSI_CERTIFY_*` environment
//! variables, or build a [`Config`] in code with [`Config::new`].
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(any(feature = "cli", feature = "docs"))]
use regex::Regex;
#[cfg(feature = "cli")]
use structopt::StructOpt;
use thiserror::Error;

use crate::drivers::{driver_by_name, DRIVER_NAMES};
use crate::external::{load_driver_definition, KubectlContext, ScriptDriver};
use crate::manifest::ManifestSource;
use crate::runner::CaseFilter;
use crate::testdriver::TestDriver;

/// Where a driver under test comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum DriverSource {
    /// A driver definition file (`--driverdef`).
    Definition(PathBuf),
    /// A driver the harness deploys itself (`--testdriver`).
    Registered(String),
    /// A bash script with `getDriverInfo` and optionally `createVolume` and
    /// `deleteVolume` (`--bash-testdriver`, `--external-testdriver`).
    Script(PathBuf),
}

impl DriverSource {
    /// Loads the driver. Scripts are queried for their driver info here.
    pub async fn load(&self) -> anyhow::Result<Box<dyn TestDriver>> {
        let driver: Box<dyn TestDriver> = match self {
            DriverSource::Definition(path) => Box::new(load_driver_definition(path).await?),
            DriverSource::Registered(name) => driver_by_name(name).ok_or_else(|| {
                ConfigError::UnknownDriver {
                    name: name.clone(),
                    known: DRIVER_NAMES.join(", "),
                }
            })?,
            DriverSource::Script(path) => {
                Box::new(ScriptDriver::load(path, Arc::new(KubectlContext::default())).await?)
            }
        };
        Ok(driver)
    }
}

/// ConfigError describes an invalid combination of settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown test driver {name:?}, expected one of {known}")]
    UnknownDriver { name: String, known: String },
    #[error("invalid --{flag} expression: {source}")]
    Filter {
        flag: &'static str,
        source: regex::Error,
    },
}

/// The configuration of a certification run.
#[derive(Clone, Debug)]
pub struct Config {
    /// The drivers under test, tested one after the other
    pub drivers: Vec<DriverSource>,
    /// The kubeconfig to use instead of the inferred one
    pub kubeconfig: Option<PathBuf>,
    /// Which test cases run
    pub filter: CaseFilter,
    /// Where driver deployment manifests are read from
    pub manifests: ManifestSource,
    /// Only list the test cases and whether they apply to the driver
    pub dry_run: bool,
}

impl Config {
    /// A config running every test case against `drivers` with the inferred
    /// kubeconfig and the built in manifests.
    pub fn new(drivers: Vec<DriverSource>) -> Self {
        Config {
            drivers,
            kubeconfig: None,
            filter: CaseFilter::default(),
            manifests: ManifestSource::default(),
            dry_run: false,
        }
    }

    /// Parses all command line flags. The version of your application should
    /// be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Result<Self, ConfigError> {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn from_opts(opts: Opts) -> Result<Self, ConfigError> {
        let mut drivers: Vec<_> = opts
            .driverdef
            .into_iter()
            .map(DriverSource::Definition)
            .collect();
        drivers.extend(opts.testdriver.map(DriverSource::Registered));
        drivers.extend(opts.bash_testdriver.map(DriverSource::Script));
        drivers.extend(opts.external_testdriver.map(DriverSource::Script));
        if drivers.is_empty() {
            drivers = all_registered_drivers();
        }

        for driver in &drivers {
            if let DriverSource::Registered(name) = driver {
                if !DRIVER_NAMES.contains(&name.as_str()) {
                    return Err(ConfigError::UnknownDriver {
                        name: name.clone(),
                        known: DRIVER_NAMES.join(", "),
                    });
                }
            }
        }

        let focus = compile("focus", opts.focus.as_deref())?;
        let skip = compile("skip", opts.skip.as_deref())?;

        Ok(Config {
            drivers,
            kubeconfig: opts.kubeconfig,
            filter: CaseFilter::from_regexes(focus, skip),
            manifests: ManifestSource::from_dir(opts.manifest_dir),
            dry_run: opts.dry_run,
        })
    }
}

/// Every driver the harness can deploy itself, tested when no driver is
/// named.
pub fn all_registered_drivers() -> Vec<DriverSource> {
    DRIVER_NAMES
        .iter()
        .map(|name| DriverSource::Registered((*name).to_owned()))
        .collect()
}

#[cfg(any(feature = "cli", feature = "docs"))]
fn compile(flag: &'static str, expr: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    expr.map(Regex::new)
        .transpose()
        .map_err(|source| ConfigError::Filter { flag, source })
}

/// CLI options for a certification run
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug, Default)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "csi-certify",
    about = "Runs the Kubernetes storage conformance suites against a CSI driver"
)]
pub struct Opts {
    #[structopt(
        long = "driverdef",
        number_of_values = 1,
        help = "Path to a .yaml or .json file describing an already installed driver, can be used more than once"
    )]
    pub driverdef: Vec<PathBuf>,

    #[structopt(
        long = "testdriver",
        env = "CSI_CERTIFY_TESTDRIVER",
        help = "Name of a driver the harness deploys itself (hostpath, nfs)"
    )]
    pub testdriver: Option<String>,

    #[structopt(
        long = "bash-testdriver",
        env = "CSI_CERTIFY_BASH_TESTDRIVER",
        help = "Path to a bash script implementing getDriverInfo, and optionally createVolume and deleteVolume"
    )]
    pub bash_testdriver: Option<PathBuf>,

    #[structopt(
        long = "external-testdriver",
        env = "CSI_CERTIFY_EXTERNAL_TESTDRIVER",
        help = "Same as --bash-testdriver"
    )]
    pub external_testdriver: Option<PathBuf>,

    #[structopt(
        long = "kubeconfig",
        help = "Path to the kubeconfig of the cluster under test, inferred from the environment when absent"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[structopt(
        long = "focus",
        env = "CSI_CERTIFY_FOCUS",
        help = "Only run test cases whose name matches this regular expression"
    )]
    pub focus: Option<String>,

    #[structopt(
        long = "skip",
        env = "CSI_CERTIFY_SKIP",
        help = "Do not run test cases whose name matches this regular expression"
    )]
    pub skip: Option<String>,

    #[structopt(
        long = "manifest-dir",
        env = "CSI_CERTIFY_MANIFEST_DIR",
        help = "Directory to read driver deployment manifests from instead of the built in ones"
    )]
    pub manifest_dir: Option<PathBuf>,

    #[structopt(
        long = "dry-run",
        help = "List the test cases and whether they apply to the driver without touching a cluster"
    )]
    pub dry_run: bool,
}
