//! The static description of a storage driver: what it is called, what it can
//! do, and how the harness gets StorageClasses and snapshot classes for it.
//!
//! A [`DriverDefinition`] is usually decoded from a `.yaml` or `.json` file
//! (or from the output of a driver script). Field names follow the casing the
//! Kubernetes storage framework uses (`DriverInfo`, `StorageClass.FromName`,
//! ...), and the camelCase spellings are accepted as well:
//!
//! ```yaml
//! DriverInfo:
//!   Name: hostpath.csi.k8s.io
//!   SupportedFsType: ["ext4"]
//!   # The set form of the Go harness works too:
//!   # SupportedFsType: {ext4: {}}
//!   Capabilities:
//!     persistence: true
//!     block: true
//! StorageClass:
//!   FromName: true
//! ```
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::pattern::FileSize;

/// The claim size used when a definition does not set one.
pub const DEFAULT_CLAIM_SIZE: &str = "5Gi";

/// An optional feature a driver may support. Test cases that need a feature
/// are skipped for drivers that do not declare it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// Data survives the pod that wrote it.
    Persistence,
    /// Raw block volumes.
    Block,
    /// The volume honours the pod's fsGroup.
    FsGroup,
    /// Files on the volume can be executed.
    Exec,
}

impl Capability {
    /// The key used for the capability in driver definition files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Persistence => "persistence",
            Capability::Block => "block",
            Capability::FsGroup => "fsGroup",
            Capability::Exec => "exec",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static information the test suites need about a driver.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverInfo {
    /// The driver name, used as provisioner name for derived StorageClasses.
    #[serde(rename = "Name", alias = "name")]
    pub name: String,
    /// Appended to test names, e.g. `[Feature:Foo]`.
    #[serde(rename = "FeatureTag", alias = "featureTag")]
    pub feature_tag: String,
    #[serde(rename = "MaxFileSize", alias = "maxFileSize")]
    pub max_file_size: FileSize,
    /// Filesystem types the driver supports. The empty string is the
    /// default filesystem and is always present.
    #[serde(
        rename = "SupportedFsType",
        alias = "supportedFsType",
        deserialize_with = "with_default_fs_type"
    )]
    pub supported_fs_type: BTreeSet<String>,
    /// Mount options the driver supports. `None` disables the mount option
    /// test case.
    #[serde(
        rename = "SupportedMountOption",
        alias = "supportedMountOption",
        deserialize_with = "optional_string_set"
    )]
    pub supported_mount_option: Option<BTreeSet<String>>,
    /// Mount options that must always be passed to the driver.
    #[serde(
        rename = "RequiredMountOption",
        alias = "requiredMountOption",
        deserialize_with = "optional_string_set"
    )]
    pub required_mount_option: Option<BTreeSet<String>>,
    #[serde(rename = "Capabilities", alias = "capabilities")]
    pub capabilities: BTreeMap<String, bool>,
}

impl DriverInfo {
    /// Information for a driver called `name` with nothing but the defaults.
    pub fn named(name: &str) -> Self {
        DriverInfo {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Builder style helper to switch on capabilities.
    pub fn with_capabilities(mut self, caps: &[Capability]) -> Self {
        for cap in caps {
            self.capabilities.insert(cap.as_str().to_owned(), true);
        }
        self
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities
            .get(cap.as_str())
            .copied()
            .unwrap_or(false)
    }

    pub fn supports_fs_type(&self, fs_type: &str) -> bool {
        self.supported_fs_type.contains(fs_type)
    }

    /// The union of supported and required mount options, which is what the
    /// mount option test case puts on its StorageClass.
    pub fn mount_options(&self) -> Vec<String> {
        self.supported_mount_option
            .iter()
            .chain(self.required_mount_option.iter())
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// The name shown in test case names: `[Driver: <name>]<feature tag>`.
    pub fn name_with_feature_tags(&self) -> String {
        format!("[Driver: {}]{}", self.name, self.feature_tag)
    }
}

impl Default for DriverInfo {
    fn default() -> Self {
        DriverInfo {
            name: String::new(),
            feature_tag: String::new(),
            max_file_size: FileSize::default(),
            supported_fs_type: default_fs_types(),
            supported_mount_option: None,
            required_mount_option: None,
            capabilities: BTreeMap::new(),
        }
    }
}

fn default_fs_types() -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    set.insert(String::new());
    set
}

/// A set of strings written either as a list or, like a Go `sets.String`,
/// as a mapping whose keys are the members.
#[derive(Deserialize)]
#[serde(untagged)]
enum StringSet {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl From<StringSet> for BTreeSet<String> {
    fn from(set: StringSet) -> Self {
        match set {
            StringSet::List(items) => items.into_iter().collect(),
            StringSet::Map(items) => items.into_keys().collect(),
        }
    }
}

fn optional_string_set<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<BTreeSet<String>>, D::Error> {
    let set: Option<StringSet> = Option::deserialize(deserializer)?;
    Ok(set.map(Into::into))
}

// Listed filesystem types add to the default one rather than replacing it.
fn with_default_fs_type<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeSet<String>, D::Error> {
    let mut set = default_fs_types();
    set.extend(optional_string_set(deserializer)?.unwrap_or_default());
    Ok(set)
}

/// Where StorageClasses for dynamic provisioning tests come from. When
/// neither field is set, dynamic provisioning tests are skipped.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageClassSource {
    /// Use a class with the driver name as provisioner and no parameters.
    #[serde(rename = "FromName", alias = "fromName")]
    pub from_name: bool,
    /// Load the class from a `.yaml` or `.json` manifest. Only consulted
    /// when `from_name` is false.
    #[serde(rename = "FromFile", alias = "fromFile", deserialize_with = "non_empty_path")]
    pub from_file: Option<PathBuf>,
}

impl StorageClassSource {
    pub fn is_empty(&self) -> bool {
        !self.from_name && self.from_file.is_none()
    }
}

fn non_empty_path<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<PathBuf>, D::Error> {
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(PathBuf::from))
}

/// Where snapshot classes come from. Snapshot tests are skipped unless
/// `from_name` is set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SnapshotClassSource {
    #[serde(rename = "FromName", alias = "fromName")]
    pub from_name: bool,
}

/// A driver described entirely by data.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverDefinition {
    #[serde(rename = "DriverInfo", alias = "driverInfo")]
    pub driver_info: DriverInfo,
    /// Used to create unique names for test cases and resources.
    #[serde(rename = "ShortName", alias = "shortName")]
    pub short_name: String,
    #[serde(rename = "StorageClass", alias = "storageClass")]
    pub storage_class: StorageClassSource,
    #[serde(rename = "SnapshotClass", alias = "snapshotClass")]
    pub snapshot_class: SnapshotClassSource,
    /// Size requested by dynamically provisioned claims.
    #[serde(rename = "ClaimSize", alias = "claimSize")]
    pub claim_size: String,
    /// Pins test pods to one node. Most drivers should rely on topology
    /// instead.
    #[serde(rename = "ClientNodeName", alias = "clientNodeName")]
    pub client_node_name: Option<String>,
}

impl Default for DriverDefinition {
    fn default() -> Self {
        DriverDefinition {
            driver_info: DriverInfo::default(),
            short_name: String::new(),
            storage_class: StorageClassSource::default(),
            snapshot_class: SnapshotClassSource::default(),
            claim_size: DEFAULT_CLAIM_SIZE.to_owned(),
            client_node_name: None,
        }
    }
}

/// DefinitionError describes why a driver definition could not be loaded.
/// All of them abort the run.
#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("missing file name")]
    MissingFileName,
    #[error("{path}: unable to read driver definition: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{origin}: {source}")]
    Decode {
        origin: String,
        source: serde_yaml::Error,
    },
    #[error("{0:?}: DriverInfo.Name not set")]
    MissingName(String),
}

impl DriverDefinition {
    /// Decodes a definition from YAML or JSON. `origin` names the source in
    /// error messages.
    pub fn from_slice(data: &[u8], origin: &str) -> Result<Self, DefinitionError> {
        // An empty document decodes to unit, not to the defaults.
        let definition: DriverDefinition = if data.iter().all(u8::is_ascii_whitespace) {
            DriverDefinition::default()
        } else {
            serde_yaml::from_slice(data).map_err(|source| DefinitionError::Decode {
                origin: origin.to_owned(),
                source,
            })?
        };
        if definition.driver_info.name.is_empty() {
            return Err(DefinitionError::MissingName(origin.to_owned()));
        }
        Ok(definition)
    }

    /// Reads and decodes a definition file.
    pub async fn from_file(path: &Path) -> Result<Self, DefinitionError> {
        if path.as_os_str().is_empty() {
            return Err(DefinitionError::MissingFileName);
        }
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| DefinitionError::Read {
                path: path.to_owned(),
                source,
            })?;
        Self::from_slice(&data, &path.display().to_string())
    }
}
