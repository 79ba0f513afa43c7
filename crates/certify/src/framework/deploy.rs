//! Deploys driver manifests into the cluster.
//!
//! Before creation every object is moved into the test namespace, and cluster
//! scoped objects get the test's unique name appended so that several test
//! cases can deploy the same driver side by side. CSI specific patching
//! (driver rename, node pinning) is done by [`patch_csi_deployment`].
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, PostParams};
use serde_json::Value;
use tracing::{debug, info};

use super::resources::TestResource;
use super::Framework;
use crate::manifest::{self, ManifestError};
use crate::storage_class::patch_name;

// Kinds that are not namespaced. Manifests only ever contain a handful of
// kinds, so a fixed table replaces API discovery.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "ClusterRole",
    "ClusterRoleBinding",
    "CSIDriver",
    "CSINode",
    "CustomResourceDefinition",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PodSecurityPolicy",
    "PriorityClass",
    "StorageClass",
    "VolumeAttachment",
    "VolumeSnapshotClass",
    "VolumeSnapshotContent",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// How a CSI driver deployment is adjusted for one test case.
#[derive(Clone, Debug, Default)]
pub struct PatchCsiOptions {
    /// The driver name used in the manifests.
    pub old_driver_name: String,
    /// The name the driver registers under for this test case.
    pub new_driver_name: String,
    /// The container running the driver itself.
    pub driver_container_name: String,
    /// Appended to the arguments of the driver container.
    pub driver_container_arguments: Vec<String>,
    /// The container running the external provisioner.
    pub provisioner_container_name: String,
    /// Pins every pod of the deployment to this node when set.
    pub node_name: Option<String>,
}

impl PatchCsiOptions {
    fn renames(&self) -> bool {
        !self.old_driver_name.is_empty()
            && !self.new_driver_name.is_empty()
            && self.old_driver_name != self.new_driver_name
    }
}

/// Rewrites a CSI deployment object for the driver name and node in `opts`.
pub fn patch_csi_deployment(object: &mut Value, opts: &PatchCsiOptions) {
    match manifest::kind(object) {
        "ReplicaSet" | "DaemonSet" | "StatefulSet" | "Deployment" => {
            if let Some(spec) = object.pointer_mut("/spec/template/spec") {
                patch_pod_spec(spec, opts);
            }
        }
        "StorageClass" => {
            if !opts.new_driver_name.is_empty() {
                object["provisioner"] = Value::String(opts.new_driver_name.clone());
            }
        }
        "CSIDriver" => {
            let metadata = object.get_mut("metadata").and_then(Value::as_object_mut);
            if let (false, Some(metadata)) = (opts.new_driver_name.is_empty(), metadata) {
                metadata.insert(
                    "name".to_owned(),
                    Value::String(opts.new_driver_name.clone()),
                );
            }
        }
        _ => (),
    }
}

fn patch_pod_spec(spec: &mut Value, opts: &PatchCsiOptions) {
    if let Some(containers) = spec.get_mut("containers").and_then(Value::as_array_mut) {
        for container in containers {
            patch_container(container, opts);
        }
    }
    if opts.renames() {
        if let Some(volumes) = spec.get_mut("volumes").and_then(Value::as_array_mut) {
            for volume in volumes {
                if let Some(path) = volume.pointer_mut("/hostPath/path") {
                    if let Some(renamed) = path.as_str().and_then(|p| rename_path(p, opts)) {
                        *path = Value::String(renamed);
                    }
                }
            }
        }
    }
    if let (Some(node), Some(spec)) = (&opts.node_name, spec.as_object_mut()) {
        spec.insert("nodeName".to_owned(), Value::String(node.clone()));
    }
}

// Paths like /var/lib/kubelet/plugins/<driver> end in the driver name.
fn rename_path(path: &str, opts: &PatchCsiOptions) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let (dir, file) = trimmed.rsplit_once('/')?;
    if file == opts.old_driver_name {
        Some(format!("{}/{}", dir, opts.new_driver_name))
    } else {
        None
    }
}

fn patch_container(container: &mut Value, opts: &PatchCsiOptions) {
    if !container.is_object() {
        return;
    }
    let name = container
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    if !container.get("args").map(Value::is_array).unwrap_or(false) {
        container["args"] = Value::Array(vec![]);
    }
    let args = match container.get_mut("args").and_then(Value::as_array_mut) {
        Some(args) => args,
        None => return,
    };

    if opts.renames() {
        let old = format!("/{}/", opts.old_driver_name);
        let new = format!("/{}/", opts.new_driver_name);
        for arg in args.iter_mut() {
            if let Some(s) = arg.as_str() {
                if s.contains(&old) {
                    *arg = Value::String(s.replacen(&old, &new, 1));
                }
            }
        }
    }

    if !opts.driver_container_name.is_empty() && name == opts.driver_container_name {
        args.extend(
            opts.driver_container_arguments
                .iter()
                .cloned()
                .map(Value::String),
        );
    } else if !opts.provisioner_container_name.is_empty()
        && name == opts.provisioner_container_name
        && !opts.new_driver_name.is_empty()
    {
        args.push(Value::String(format!(
            "--provisioner={}",
            opts.new_driver_name
        )));
    }
}

/// Moves an object into the test namespace, or makes its name unique when it
/// is cluster scoped. Bindings are pointed at the patched subjects and roles.
pub fn patch_item(object: &mut Value, namespace: &str, unique: &str) -> Result<(), ManifestError> {
    let kind = manifest::kind(object).to_owned();
    let name = manifest::name(object).to_owned();
    let metadata = object
        .get_mut("metadata")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ManifestError::Metadata {
            kind: kind.clone(),
            name: name.clone(),
        })?;
    if is_cluster_scoped(&kind) {
        metadata.insert("name".to_owned(), Value::String(patch_name(&name, unique)));
    } else {
        metadata.insert("namespace".to_owned(), Value::String(namespace.to_owned()));
    }

    if kind == "RoleBinding" || kind == "ClusterRoleBinding" {
        if let Some(subjects) = object.get_mut("subjects").and_then(Value::as_array_mut) {
            for subject in subjects.iter_mut().filter_map(Value::as_object_mut) {
                if subject.contains_key("namespace")
                    || subject.get("kind").and_then(Value::as_str) == Some("ServiceAccount")
                {
                    subject.insert("namespace".to_owned(), Value::String(namespace.to_owned()));
                }
            }
        }
        let role_kind = object
            .pointer("/roleRef/kind")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if role_kind == "ClusterRole" {
            if let Some(role_name) = object.pointer_mut("/roleRef/name") {
                if let Some(name) = role_name.as_str() {
                    *role_name = Value::String(patch_name(name, unique));
                }
            }
        }
    }
    Ok(())
}

/// The API resource for an untyped object, from its `apiVersion` and `kind`.
pub fn api_resource(object: &Value) -> anyhow::Result<ApiResource> {
    let kind = manifest::kind(object);
    let api_version = manifest::api_version(object);
    if kind.is_empty() || api_version.is_empty() {
        anyhow::bail!(
            "object {:?} lacks apiVersion or kind",
            manifest::name(object)
        );
    }
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(
        group, version, kind,
    )))
}

/// Creates an untyped object and registers it for cleanup.
pub async fn create_item(framework: &mut Framework, object: Value) -> anyhow::Result<()> {
    let resource = api_resource(&object)?;
    let namespaced = !is_cluster_scoped(&resource.kind);
    let dynamic: DynamicObject = serde_json::from_value(object)?;
    let name = dynamic
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("{} without a name", resource.kind))?;

    let api: Api<DynamicObject> = if namespaced {
        Api::namespaced_with(framework.client(), framework.namespace(), &resource)
    } else {
        Api::all_with(framework.client(), &resource)
    };
    debug!(kind = %resource.kind, %name, "Creating object");
    api.create(&PostParams::default(), &dynamic).await?;

    let namespace = if namespaced {
        Some(framework.namespace().to_owned())
    } else {
        None
    };
    framework.resources().push(TestResource::Dynamic {
        resource,
        namespace,
        name,
    });
    Ok(())
}

/// Loads, patches and creates every object of the given manifests. The
/// objects are deleted when the framework tears down.
pub async fn create_from_manifests<F>(
    framework: &mut Framework,
    patch: F,
    files: &[&str],
) -> anyhow::Result<()>
where
    F: Fn(&mut Value),
{
    let mut items = Vec::new();
    for file in files {
        items.extend(framework.manifests().load(file).await?);
    }
    info!(
        count = items.len(),
        namespace = framework.namespace(),
        "Creating objects from manifests"
    );
    for mut item in items {
        patch_item(&mut item, framework.namespace(), framework.unique_name())?;
        patch(&mut item);
        create_item(framework, item).await?;
    }
    Ok(())
}
