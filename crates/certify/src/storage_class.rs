//! StorageClass and VolumeSnapshotClass construction for drivers.
use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde_json::json;

use crate::driver::DriverDefinition;
use crate::manifest::{self, ManifestError};

/// The StorageClass parameter CSI provisioners read the filesystem type from.
pub const FS_TYPE_PARAMETER: &str = "csi.storage.k8s.io/fstype";

pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";
pub const SNAPSHOT_VERSION: &str = "v1";

/// A class named `<provisioner>-sc` with no parameters other than the
/// filesystem type, when one is requested.
pub fn derive_storage_class(provisioner: &str, fs_type: &str) -> StorageClass {
    let mut parameters = BTreeMap::new();
    if !fs_type.is_empty() {
        parameters.insert(FS_TYPE_PARAMETER.to_owned(), fs_type.to_owned());
    }
    StorageClass {
        metadata: ObjectMeta {
            name: Some(format!("{}-sc", provisioner)),
            ..Default::default()
        },
        provisioner: provisioner.to_owned(),
        parameters: Some(parameters),
        ..Default::default()
    }
}

/// Loads a class from a manifest holding exactly one StorageClass and sets
/// the filesystem type on it.
pub async fn load_storage_class(path: &Path, fs_type: &str) -> Result<StorageClass, ManifestError> {
    let items = manifest::load(path).await?;
    storage_class_from_items(items, fs_type, &path.display().to_string())
}

pub(crate) fn storage_class_from_items(
    mut items: Vec<serde_json::Value>,
    fs_type: &str,
    origin: &str,
) -> Result<StorageClass, ManifestError> {
    if items.len() != 1 {
        return Err(ManifestError::Count {
            origin: origin.to_owned(),
            count: items.len(),
        });
    }
    let mut class: StorageClass = manifest::into_typed(items.remove(0), "StorageClass", origin)?;
    if !fs_type.is_empty() {
        class
            .parameters
            .get_or_insert_with(BTreeMap::new)
            .insert(FS_TYPE_PARAMETER.to_owned(), fs_type.to_owned());
    }
    Ok(class)
}

/// The class for a driver described by data. Deriving from the name takes
/// precedence over loading from a file.
pub async fn definition_storage_class(
    definition: &DriverDefinition,
    fs_type: &str,
) -> Result<StorageClass, ManifestError> {
    match &definition.storage_class.from_file {
        Some(path) if !definition.storage_class.from_name => {
            load_storage_class(path, fs_type).await
        }
        _ => Ok(derive_storage_class(&definition.driver_info.name, fs_type)),
    }
}

/// An unstructured VolumeSnapshotClass named `<namespace>-<snapshotter>-vsc`.
pub fn snapshot_class(snapshotter: &str, namespace: &str) -> DynamicObject {
    let gvk = GroupVersionKind::gvk(SNAPSHOT_GROUP, SNAPSHOT_VERSION, "VolumeSnapshotClass");
    DynamicObject::new(
        &format!("{}-{}-vsc", namespace, snapshotter),
        &ApiResource::from_gvk(&gvk),
    )
    .data(json!({
        "driver": snapshotter,
        "deletionPolicy": "Delete",
        "parameters": {},
    }))
}

/// Appends the unique name of a test case to the name of a cluster scoped
/// object, so that concurrent runs against one cluster do not collide.
pub fn patch_name(name: &str, unique: &str) -> String {
    if unique.is_empty() || name.ends_with(&format!("-{}", unique)) {
        name.to_owned()
    } else {
        format!("{}-{}", name, unique)
    }
}
