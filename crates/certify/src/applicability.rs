//! Decides whether a test case applies to a driver.
//!
//! A mismatch between what a pattern needs and what a driver declares is a
//! [`Skip`], never a failure: the case is reported as skipped with the reason
//! and the run carries on.
use thiserror::Error;

use crate::driver::{Capability, DriverDefinition};
use crate::pattern::{SnapshotType, TestPattern, TestVolMode, TestVolType};
use crate::testdriver::TestDriver;

/// A test case does not apply to the driver under test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct Skip {
    pub reason: String,
}

impl Skip {
    pub fn new(reason: impl Into<String>) -> Self {
        Skip {
            reason: reason.into(),
        }
    }
}

/// The checks every driver goes through before its own predicate: the
/// driver must implement the interface the volume type needs, support the
/// pattern's filesystem and, for block patterns, declare block support.
pub fn skip_unsupported_test(driver: &dyn TestDriver, pattern: &TestPattern) -> Result<(), Skip> {
    let info = driver.driver_info();

    let implemented = match pattern.vol_type {
        TestVolType::InlineVolume => false,
        TestVolType::PreprovisionedPV => {
            driver.as_preprovisioned_volume().is_some() && driver.as_preprovisioned_pv().is_some()
        }
        TestVolType::DynamicPV => driver.as_dynamic_pv().is_some(),
    };
    if !implemented {
        return Err(Skip::new(format!(
            "Driver {} doesn't support {} -- skipping",
            info.name, pattern.vol_type
        )));
    }

    if !info.supports_fs_type(pattern.fs_type) {
        return Err(Skip::new(format!(
            "Driver {} doesn't support fs type {:?} -- skipping",
            info.name, pattern.fs_type
        )));
    }

    if pattern.vol_mode == TestVolMode::Block && !info.has_capability(Capability::Block) {
        return Err(Skip::new(format!(
            "Driver {} doesn't support {} -- skipping",
            info.name,
            TestVolMode::Block.as_str()
        )));
    }

    if pattern.snapshot_type != SnapshotType::None && driver.as_snapshottable().is_none() {
        return Err(Skip::new(format!(
            "Driver {} doesn't support snapshots -- skipping",
            info.name
        )));
    }

    driver.skip_unsupported_test(pattern)
}

/// The predicate for drivers described by a [`DriverDefinition`].
///
/// `preprovisioned` reports whether the adapter can create volumes itself,
/// which only script drivers can.
pub fn definition_supports(
    definition: &DriverDefinition,
    pattern: &TestPattern,
    preprovisioned: bool,
) -> Result<(), Skip> {
    let name = &definition.driver_info.name;

    let supported = match pattern.vol_type {
        TestVolType::DynamicPV => !definition.storage_class.is_empty(),
        TestVolType::PreprovisionedPV => preprovisioned,
        TestVolType::InlineVolume => false,
    };
    if !supported {
        return Err(Skip::new(format!(
            "Driver {:?} does not support volume type {:?} - skipping",
            name,
            pattern.vol_type.to_string()
        )));
    }

    let supported = match pattern.snapshot_type {
        SnapshotType::None => true,
        SnapshotType::DynamicCreatedSnapshot => definition.snapshot_class.from_name,
    };
    if !supported {
        return Err(Skip::new(format!(
            "Driver {:?} does not support snapshot type {:?} - skipping",
            name,
            pattern.snapshot_type.to_string()
        )));
    }

    Ok(())
}
