//! The interface between test suites and the driver under test.
//!
//! Every driver implements [`TestDriver`]. The optional interfaces
//! ([`DynamicPvTestDriver`], [`PreprovisionedVolumeTestDriver`],
//! [`PreprovisionedPvTestDriver`], [`SnapshottableTestDriver`]) are exposed
//! through the `as_*` accessors, which return `None` unless the driver
//! overrides them. Suites use the accessors to decide which cases can run.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, VolumeNodeAffinity};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;

use crate::applicability::Skip;
use crate::driver::DriverInfo;
use crate::framework::Framework;
use crate::manifest::ManifestError;
use crate::pattern::{TestPattern, TestVolType};

/// Per test case settings handed from the driver to the suite.
#[derive(Clone, Debug, PartialEq)]
pub struct PerTestConfig {
    /// Prefix for the objects a suite creates on behalf of the driver.
    pub prefix: String,
    /// The namespace the test case runs in.
    pub namespace: String,
    /// Unique for every test case, used to keep cluster scoped objects apart.
    pub unique_name: String,
    /// When set, every test pod is pinned to this node. Chosen during
    /// `prepare_test` and dropped together with the config.
    pub client_node_name: Option<String>,
}

impl PerTestConfig {
    pub fn new(prefix: &str, framework: &Framework) -> Self {
        PerTestConfig::for_namespace(prefix, framework.namespace(), framework.unique_name())
    }

    pub fn for_namespace(prefix: &str, namespace: &str, unique_name: &str) -> Self {
        PerTestConfig {
            prefix: prefix.to_owned(),
            namespace: namespace.to_owned(),
            unique_name: unique_name.to_owned(),
            client_node_name: None,
        }
    }

    /// The driver name made unique for this test case, for drivers that are
    /// deployed once per test.
    pub fn unique_driver_name(&self, info: &DriverInfo) -> String {
        format!("{}-{}", info.name, self.unique_name)
    }
}

/// A storage driver under test.
#[async_trait::async_trait]
pub trait TestDriver: Send + Sync {
    fn driver_info(&self) -> &DriverInfo;

    /// The driver's own applicability predicate. Generic checks live in
    /// [`crate::applicability::skip_unsupported_test`], which calls this last.
    fn skip_unsupported_test(&self, pattern: &TestPattern) -> Result<(), Skip>;

    /// Sets up whatever the driver needs for one test case. Objects the driver
    /// deploys must be registered with the framework's resource manager so
    /// that they are removed when the test case ends.
    async fn prepare_test(&self, framework: &mut Framework) -> anyhow::Result<PerTestConfig>;

    /// Filters the patterns of a suite before test cases are generated.
    fn tune_patterns(&self, patterns: &[TestPattern]) -> Vec<TestPattern> {
        patterns.to_vec()
    }

    fn as_dynamic_pv(&self) -> Option<&dyn DynamicPvTestDriver> {
        None
    }

    fn as_preprovisioned_volume(&self) -> Option<&dyn PreprovisionedVolumeTestDriver> {
        None
    }

    fn as_preprovisioned_pv(&self) -> Option<&dyn PreprovisionedPvTestDriver> {
        None
    }

    fn as_snapshottable(&self) -> Option<&dyn SnapshottableTestDriver> {
        None
    }
}

/// A driver that provisions volumes from a StorageClass.
#[async_trait::async_trait]
pub trait DynamicPvTestDriver: Send + Sync {
    /// The class used for dynamic provisioning. A non-empty `fs_type` ends
    /// up in the `csi.storage.k8s.io/fstype` parameter.
    async fn dynamic_provision_storage_class(
        &self,
        config: &PerTestConfig,
        fs_type: &str,
    ) -> Result<StorageClass, ManifestError>;

    fn claim_size(&self) -> String;
}

/// A volume created by a driver outside of Kubernetes' provisioning.
#[async_trait::async_trait]
pub trait TestVolume: Send + Sync {
    /// Attributes identifying the volume to the driver.
    fn attributes(&self) -> BTreeMap<String, String>;

    async fn delete_volume(&self, framework: &Framework) -> anyhow::Result<()>;
}

/// A driver that can create volumes for the pre-provisioned patterns.
#[async_trait::async_trait]
pub trait PreprovisionedVolumeTestDriver: Send + Sync {
    async fn create_volume(
        &self,
        framework: &Framework,
        config: &PerTestConfig,
        vol_type: TestVolType,
    ) -> anyhow::Result<Box<dyn TestVolume>>;
}

/// A driver that can describe a created volume as a PersistentVolume source.
pub trait PreprovisionedPvTestDriver: Send + Sync {
    fn persistent_volume_source(
        &self,
        read_only: bool,
        fs_type: &str,
        volume: &dyn TestVolume,
    ) -> (CSIPersistentVolumeSource, Option<VolumeNodeAffinity>);
}

/// A driver with snapshot support.
pub trait SnapshottableTestDriver: Send + Sync {
    fn snapshot_class(&self, config: &PerTestConfig) -> Result<DynamicObject, Skip>;
}
