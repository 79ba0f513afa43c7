//! A conformance test harness for [CSI](https://kubernetes-csi.github.io/docs/)
//! storage drivers running on Kubernetes.
//!
//! A driver under test implements [`TestDriver`]. It can be described by a
//! definition file ([`external::load_driver_definition`]), by a bash script
//! ([`external::ScriptDriver`]) or picked from the drivers the harness
//! deploys itself ([`drivers::driver_by_name`]). The generic suites in
//! [`suites`] are expanded into test cases for the driver and run one after
//! another by a [`runner::Runner`], each in a fresh namespace.
//!
//! # Example
//! ```rust,no_run
//! use certify::config::{Config, DriverSource};
//! use certify::runner::Runner;
//! use certify::suites::{csi_test_suites, define_test_suite};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::new(vec![DriverSource::Registered("hostpath".to_owned())]);
//!     let client = kube::Client::try_default().await?;
//!     for source in &config.drivers {
//!         let driver = source.load().await?;
//!         let cases = define_test_suite(driver.as_ref(), &csi_test_suites());
//!         let runner = Runner::new(
//!             client.clone(),
//!             driver,
//!             config.manifests.clone(),
//!             config.filter.clone(),
//!         );
//!         let report = runner.run(&cases).await;
//!         println!("{}", report);
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod applicability;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod external;
pub mod framework;
pub mod manifest;
pub mod pattern;
pub mod quantity;
pub mod runner;
pub mod storage_class;
pub mod suites;
pub mod testdriver;

#[doc(inline)]
pub use driver::{DriverDefinition, DriverInfo};
#[doc(inline)]
pub use testdriver::TestDriver;
