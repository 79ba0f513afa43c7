//! Tracks objects created during a test case and deletes them afterwards.
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject};
use tracing::{debug, warn};

/// An object owned by a test case.
#[derive(Clone, Debug)]
pub enum TestResource {
    Pod(String),
    PersistentVolumeClaim(String),
    PersistentVolume(String),
    StorageClass(String),
    /// Anything created from a manifest. `namespace` is `None` for cluster
    /// scoped kinds.
    Dynamic {
        resource: ApiResource,
        namespace: Option<String>,
        name: String,
    },
}

impl std::fmt::Display for TestResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestResource::Pod(name) => write!(f, "pod {}", name),
            TestResource::PersistentVolumeClaim(name) => write!(f, "persistentvolumeclaim {}", name),
            TestResource::PersistentVolume(name) => write!(f, "persistentvolume {}", name),
            TestResource::StorageClass(name) => write!(f, "storageclass {}", name),
            TestResource::Dynamic { resource, name, .. } => {
                write!(f, "{} {}", resource.kind.to_lowercase(), name)
            }
        }
    }
}

/// Deletes every registered object, newest first, when cleaned up or
/// dropped.
pub struct TestResourceManager {
    client: kube::Client,
    namespace: String,
    resources: Vec<TestResource>,
}

impl Drop for TestResourceManager {
    fn drop(&mut self) {
        if self.resources.is_empty() {
            return;
        }
        let resources = std::mem::take(&mut self.resources);
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let t = std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(clean_up_resources(client, resources, namespace));
            Ok::<_, std::io::Error>(())
        });

        match t.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => warn!(error = %e, "Unable to start runtime for resource cleanup"),
            Err(_) => warn!("Resource cleanup thread panicked"),
        }
    }
}

impl TestResourceManager {
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        TestResourceManager {
            client,
            namespace: namespace.to_owned(),
            resources: vec![],
        }
    }

    pub fn push(&mut self, resource: TestResource) {
        debug!(%resource, "Tracking test resource");
        self.resources.push(resource)
    }

    /// Deletes everything registered so far. Failures are logged and do not
    /// stop the remaining deletions.
    pub async fn clean_up(&mut self) {
        let resources = std::mem::take(&mut self.resources);
        clean_up_resources(self.client.clone(), resources, self.namespace.clone()).await
    }
}

// This needs to be a free function to work nicely with the Drop
// implementation
async fn clean_up_resources(client: kube::Client, resources: Vec<TestResource>, namespace: String) {
    let failures: Vec<_> = futures::stream::iter(resources.into_iter().rev())
        .then(|r| clean_up_resource(client.clone(), r, &namespace))
        .filter_map(|e| async move { e })
        .collect()
        .await;

    for failure in failures {
        warn!(%failure, "Unable to clean up test resource");
    }
}

async fn clean_up_resource(
    client: kube::Client,
    resource: TestResource,
    namespace: &str,
) -> Option<String> {
    let dp = DeleteParams::default();
    let result = match &resource {
        TestResource::Pod(name) => Api::<Pod>::namespaced(client, namespace)
            .delete(name, &dp)
            .await
            .map(|_| ()),
        TestResource::PersistentVolumeClaim(name) => {
            Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                .delete(name, &dp)
                .await
                .map(|_| ())
        }
        TestResource::PersistentVolume(name) => Api::<PersistentVolume>::all(client)
            .delete(name, &dp)
            .await
            .map(|_| ()),
        TestResource::StorageClass(name) => Api::<StorageClass>::all(client)
            .delete(name, &dp)
            .await
            .map(|_| ()),
        TestResource::Dynamic {
            resource: ar,
            namespace: Some(ns),
            name,
        } => Api::<DynamicObject>::namespaced_with(client, ns, ar)
            .delete(name, &dp)
            .await
            .map(|_| ()),
        TestResource::Dynamic {
            resource: ar,
            namespace: None,
            name,
        } => Api::<DynamicObject>::all_with(client, ar)
            .delete(name, &dp)
            .await
            .map(|_| ()),
    };

    match result {
        Ok(()) => {
            debug!(%resource, "Deleted test resource");
            None
        }
        Err(e) if is_not_found(&e) => None,
        Err(e) => Some(format!("{} ({})", resource, e)),
    }
}

/// Whether the API server answered with 404.
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(e) if e.code == 404)
}
