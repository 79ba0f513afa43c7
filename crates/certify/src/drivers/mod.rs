//! Drivers the harness knows how to deploy itself (`--testdriver`).
//!
//! Each test case gets its own copy of the driver, deployed from the
//! manifests under `manifests/` into the test namespace and removed with it.
use crate::testdriver::TestDriver;

mod hostpath;
mod nfs;

pub use hostpath::HostpathDriver;
pub use nfs::NfsDriver;

/// Names accepted by [`driver_by_name`].
pub const DRIVER_NAMES: &[&str] = &["hostpath", "nfs"];

pub fn driver_by_name(name: &str) -> Option<Box<dyn TestDriver>> {
    match name {
        "hostpath" => Some(Box::new(HostpathDriver::new())),
        "nfs" => Some(Box::new(NfsDriver::new())),
        _ => None,
    }
}
