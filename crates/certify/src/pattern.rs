//! Test patterns: the combination of volume lifecycle, filesystem type,
//! volume mode and snapshot mode that parameterizes a generic test body.

use std::fmt;

use serde::{Deserialize, Deserializer};

/// How the volume under test comes to exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestVolType {
    /// The volume is declared directly inside the pod spec.
    InlineVolume,
    /// The test creates a PersistentVolume up front and binds a claim to it.
    PreprovisionedPV,
    /// The driver provisions the volume from a StorageClass.
    DynamicPV,
}

impl fmt::Display for TestVolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestVolType::InlineVolume => "InlineVolume",
            TestVolType::PreprovisionedPV => "PreprovisionedPV",
            TestVolType::DynamicPV => "DynamicPV",
        };
        f.write_str(s)
    }
}

/// Whether the volume is consumed as a mounted filesystem or as a raw block
/// device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TestVolMode {
    Filesystem,
    Block,
}

impl TestVolMode {
    /// The value used in `spec.volumeMode` of claims and volumes.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestVolMode::Filesystem => "Filesystem",
            TestVolMode::Block => "Block",
        }
    }
}

impl Default for TestVolMode {
    fn default() -> Self {
        TestVolMode::Filesystem
    }
}

/// The snapshot flavour a pattern asks for. `None` renders as the empty string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnapshotType {
    None,
    DynamicCreatedSnapshot,
}

impl Default for SnapshotType {
    fn default() -> Self {
        SnapshotType::None
    }
}

impl fmt::Display for SnapshotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotType::None => Ok(()),
            SnapshotType::DynamicCreatedSnapshot => f.write_str("DynamicSnapshot"),
        }
    }
}

const MI: i64 = 1024 * 1024;

/// The largest file size a driver can be tested with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileSize {
    Small,
    Medium,
    Large,
}

impl FileSize {
    const ALL: [FileSize; 3] = [FileSize::Small, FileSize::Medium, FileSize::Large];

    /// Every size from the smallest up to and including `self`.
    pub fn up_to(self) -> Vec<FileSize> {
        FileSize::ALL.iter().copied().filter(|s| *s <= self).collect()
    }

    pub fn bytes(&self) -> i64 {
        match self {
            FileSize::Small => MI,
            FileSize::Medium => 100 * MI,
            FileSize::Large => 1024 * MI,
        }
    }
}

impl Default for FileSize {
    fn default() -> Self {
        FileSize::Small
    }
}

// Driver files written for the Go harness carry the raw byte count, newer
// ones use the names.
impl<'de> Deserialize<'de> for FileSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bytes(i64),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Bytes(b) if b >= FileSize::Large.bytes() => Ok(FileSize::Large),
            Raw::Bytes(b) if b >= FileSize::Medium.bytes() => Ok(FileSize::Medium),
            Raw::Bytes(_) => Ok(FileSize::Small),
            Raw::Name(name) => match name.to_lowercase().as_str() {
                "small" => Ok(FileSize::Small),
                "medium" => Ok(FileSize::Medium),
                "large" => Ok(FileSize::Large),
                other => Err(serde::de::Error::custom(format!(
                    "unknown file size {:?}, expected small, medium or large",
                    other
                ))),
            },
        }
    }
}

/// A single parameterization of a test suite.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestPattern {
    pub name: &'static str,
    pub vol_type: TestVolType,
    pub fs_type: &'static str,
    pub vol_mode: TestVolMode,
    pub snapshot_type: SnapshotType,
}

impl TestPattern {
    const fn new(
        name: &'static str,
        vol_type: TestVolType,
        fs_type: &'static str,
        vol_mode: TestVolMode,
    ) -> Self {
        TestPattern {
            name,
            vol_type,
            fs_type,
            vol_mode,
            snapshot_type: SnapshotType::None,
        }
    }
}

impl fmt::Display for TestPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Testpattern: {}]", self.name)
    }
}

pub const DEFAULT_FS_INLINE_VOLUME: TestPattern = TestPattern::new(
    "Inline-volume (default fs)",
    TestVolType::InlineVolume,
    "",
    TestVolMode::Filesystem,
);

pub const DEFAULT_FS_PREPROVISIONED_PV: TestPattern = TestPattern::new(
    "Pre-provisioned PV (default fs)",
    TestVolType::PreprovisionedPV,
    "",
    TestVolMode::Filesystem,
);

pub const DEFAULT_FS_DYNAMIC_PV: TestPattern = TestPattern::new(
    "Dynamic PV (default fs)",
    TestVolType::DynamicPV,
    "",
    TestVolMode::Filesystem,
);

pub const EXT4_DYNAMIC_PV: TestPattern = TestPattern::new(
    "Dynamic PV (ext4)",
    TestVolType::DynamicPV,
    "ext4",
    TestVolMode::Filesystem,
);

pub const XFS_DYNAMIC_PV: TestPattern = TestPattern::new(
    "Dynamic PV (xfs)",
    TestVolType::DynamicPV,
    "xfs",
    TestVolMode::Filesystem,
);

pub const BLOCK_VOL_MODE_PREPROVISIONED_PV: TestPattern = TestPattern::new(
    "Pre-provisioned PV (block volmode)",
    TestVolType::PreprovisionedPV,
    "",
    TestVolMode::Block,
);

pub const BLOCK_VOL_MODE_DYNAMIC_PV: TestPattern = TestPattern::new(
    "Dynamic PV (block volmode)",
    TestVolType::DynamicPV,
    "",
    TestVolMode::Block,
);

pub const DYNAMIC_SNAPSHOT: TestPattern = TestPattern {
    name: "Dynamic Snapshot",
    vol_type: TestVolType::DynamicPV,
    fs_type: "",
    vol_mode: TestVolMode::Filesystem,
    snapshot_type: SnapshotType::DynamicCreatedSnapshot,
};

/// Drops the inline and pre-provisioned patterns, which CSI drivers deployed
/// from manifests cannot serve.
pub fn csi_tune_pattern(patterns: &[TestPattern]) -> Vec<TestPattern> {
    patterns
        .iter()
        .filter(|p| {
            !matches!(
                p.vol_type,
                TestVolType::InlineVolume | TestVolType::PreprovisionedPV
            )
        })
        .cloned()
        .collect()
}
