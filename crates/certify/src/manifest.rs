//! Loading of Kubernetes manifests.
//!
//! A manifest file holds one or more YAML (or JSON) documents separated by
//! `---`. Every document becomes one [`serde_json::Value`]; `kind: List`
//! documents are flattened into their items. Objects stay untyped until the
//! caller knows which type to expect, see [`into_typed`].
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// ManifestError describes why a manifest could not be used.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("{path}: unable to read manifest: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{origin}: unable to parse manifest: {source}")]
    Parse {
        origin: String,
        source: serde_yaml::Error,
    },
    #[error("{origin}: document {index} is not a Kubernetes object")]
    NotAnObject { origin: String, index: usize },
    #[error("{origin}: expected exactly one item, found {count}")]
    Count { origin: String, count: usize },
    #[error("{origin}: expected a {expected}, found {found:?}")]
    Kind {
        origin: String,
        expected: &'static str,
        found: String,
    },
    #[error("{origin}: invalid {kind}: {source}")]
    Convert {
        origin: String,
        kind: String,
        source: serde_json::Error,
    },
    #[error("{kind} {name:?}: metadata is not a mapping")]
    Metadata { kind: String, name: String },
    #[error("no manifest named {0:?} is built in")]
    UnknownEmbedded(String),
}

/// Parses every document in `data`. `origin` names the source in errors.
pub fn parse(data: &str, origin: &str) -> Result<Vec<Value>, ManifestError> {
    let mut items = Vec::new();
    for (index, document) in documents(data).into_iter().enumerate() {
        let value: Value =
            serde_yaml::from_str(&document).map_err(|source| ManifestError::Parse {
                origin: origin.to_owned(),
                source,
            })?;
        match value {
            Value::Null => continue,
            Value::Object(_) if kind(&value) == "List" => {
                let list_items = value
                    .get("items")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for item in list_items {
                    if !item.is_object() {
                        return Err(ManifestError::NotAnObject {
                            origin: origin.to_owned(),
                            index,
                        });
                    }
                    items.push(item);
                }
            }
            Value::Object(_) => items.push(value),
            _ => {
                return Err(ManifestError::NotAnObject {
                    origin: origin.to_owned(),
                    index,
                })
            }
        }
    }
    Ok(items)
}

// Splits a stream on `---` separator lines and drops documents that hold
// nothing but blank lines and comments.
fn documents(data: &str) -> Vec<String> {
    let mut documents = vec![String::new()];
    for line in data.lines() {
        if line.starts_with("---") && line[3..].trim().is_empty() {
            documents.push(String::new());
            continue;
        }
        if let Some(current) = documents.last_mut() {
            current.push_str(line);
            current.push('\n');
        }
    }
    documents
        .into_iter()
        .filter(|doc| {
            doc.lines().any(|l| {
                let l = l.trim();
                !l.is_empty() && !l.starts_with('#')
            })
        })
        .collect()
}

/// Reads and parses a manifest file.
pub async fn load(path: &Path) -> Result<Vec<Value>, ManifestError> {
    let data = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ManifestError::Read {
            path: path.to_owned(),
            source,
        })?;
    parse(&data, &path.display().to_string())
}

/// The `kind` of an object, empty when absent.
pub fn kind(value: &Value) -> &str {
    value.get("kind").and_then(Value::as_str).unwrap_or_default()
}

/// The `apiVersion` of an object, empty when absent.
pub fn api_version(value: &Value) -> &str {
    value
        .get("apiVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// The `metadata.name` of an object, empty when absent.
pub fn name(value: &Value) -> &str {
    value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

/// Converts an untyped object into `T` after checking its kind.
pub fn into_typed<T: DeserializeOwned>(
    value: Value,
    expected: &'static str,
    origin: &str,
) -> Result<T, ManifestError> {
    let found = kind(&value).to_owned();
    if found != expected {
        return Err(ManifestError::Kind {
            origin: origin.to_owned(),
            expected,
            found,
        });
    }
    serde_json::from_value(value).map_err(|source| ManifestError::Convert {
        origin: origin.to_owned(),
        kind: found,
        source,
    })
}

/// Where driver deployment manifests are read from.
#[derive(Clone, Debug)]
pub enum ManifestSource {
    /// The manifests compiled into the binary.
    Embedded,
    /// A directory with the same layout as the built in manifests.
    Directory(PathBuf),
}

impl Default for ManifestSource {
    fn default() -> Self {
        ManifestSource::Embedded
    }
}

impl ManifestSource {
    pub fn from_dir(dir: Option<PathBuf>) -> Self {
        dir.map(ManifestSource::Directory).unwrap_or_default()
    }

    /// Loads the manifest at `relative`, e.g. `hostpath/csi-hostpath-plugin.yaml`.
    pub async fn load(&self, relative: &str) -> Result<Vec<Value>, ManifestError> {
        match self {
            ManifestSource::Embedded => {
                let data = embedded(relative)
                    .ok_or_else(|| ManifestError::UnknownEmbedded(relative.to_owned()))?;
                parse(data, relative)
            }
            ManifestSource::Directory(dir) => load(&dir.join(relative)).await,
        }
    }
}

macro_rules! embedded_manifests {
    ($($path:literal),* $(,)?) => {
        const EMBEDDED: &[(&str, &str)] = &[
            $(($path, include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/manifests/", $path))),)*
        ];
    };
}

embedded_manifests!(
    "hostpath/csi-hostpath-rbac.yaml",
    "hostpath/csi-hostpath-driverinfo.yaml",
    "hostpath/csi-hostpath-plugin.yaml",
    "hostpath/e2e-test-rbac.yaml",
    "nfs/csi-nfsplugin-rbac.yaml",
    "nfs/csi-nfsplugin-driverinfo.yaml",
    "nfs/csi-nodeplugin-nfsplugin.yaml",
);

fn embedded(relative: &str) -> Option<&'static str> {
    EMBEDDED
        .iter()
        .find(|(path, _)| *path == relative)
        .map(|(_, data)| *data)
}
