//! Drivers described from outside the harness: by a definition file
//! (`--driverdef`) or by a bash script (`--bash-testdriver`,
//! `--external-testdriver`).
use std::path::PathBuf;

use thiserror::Error;

use crate::driver::DefinitionError;

mod definition;
pub mod namespace;
mod script;

pub use definition::{load_driver_definition, DefinitionDriver};
pub use namespace::{KubectlContext, NamespaceContext};
pub use script::{ScriptDriver, ScriptVolume};

/// Prefix of the per test configuration of external drivers.
pub const EXTERNAL_PREFIX: &str = "external";

/// ScriptError describes a failure talking to a driver script or to
/// kubectl on its behalf.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("missing file name")]
    MissingFileName,
    #[error("invalid test driver {script}: must include {function}() function")]
    MissingFunction { script: PathBuf, function: String },
    #[error("unable to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{function} in {script} failed ({status}): {stderr}")]
    Failed {
        script: PathBuf,
        function: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("{command} failed: {output}")]
    Kubectl { command: String, output: String },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("createVolume in {script} did not print a JSON string map: {source}")]
    VolumeAttributes {
        script: PathBuf,
        source: serde_json::Error,
    },
}
