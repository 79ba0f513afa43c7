use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use kube::api::{Api, DeleteParams, ListParams};
use serde::de::DeserializeOwned;

const TEST_NS_PREFIX: &str = "csi-certify-";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let result = smite_all_certification_resources().await;

    match &result {
        Ok(message) => println!("{}", message),
        Err(e) => println!("{}", e),
    };

    result.map(|_| ())
}

async fn smite_all_certification_resources() -> anyhow::Result<&'static str> {
    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to acquire Kubernetes client: {}", e))?;

    let namespaces = list_test_namespaces(client.clone()).await?;
    let storage_classes = list_left_over::<StorageClass>(client.clone()).await?;
    let cluster_roles = list_left_over::<ClusterRole>(client.clone()).await?;
    let bindings = list_left_over::<ClusterRoleBinding>(client.clone()).await?;

    let leftovers: Vec<String> = namespaces
        .iter()
        .chain(&storage_classes)
        .chain(&cluster_roles)
        .chain(&bindings)
        .cloned()
        .collect();
    if leftovers.is_empty() {
        return Ok("No csi-certify resources found");
    }
    if !confirm_smite(&leftovers) {
        return Ok("Operation cancelled");
    }

    let pod_smite_operations = namespaces
        .iter()
        .map(|ns| smite_namespace_pods(client.clone(), ns));
    let pod_errors = errors_of(futures::future::join_all(pod_smite_operations).await);
    if !pod_errors.is_empty() {
        return Err(smite_failure_error(&pod_errors));
    }

    println!("Requested force-delete of all pods; requesting delete of namespaces and cluster objects...");

    let mut errors = Vec::new();
    for ns in &namespaces {
        errors.extend(smite::<Namespace>(client.clone(), ns).await.err());
    }
    for name in &storage_classes {
        errors.extend(smite::<StorageClass>(client.clone(), name).await.err());
    }
    for name in &bindings {
        errors.extend(smite::<ClusterRoleBinding>(client.clone(), name).await.err());
    }
    for name in &cluster_roles {
        errors.extend(smite::<ClusterRole>(client.clone(), name).await.err());
    }
    if !errors.is_empty() {
        return Err(smite_failure_error(&errors));
    }

    Ok("All csi-certify resources deleted; namespace cleanup may take a couple of minutes")
}

async fn list_test_namespaces(client: kube::Client) -> anyhow::Result<Vec<String>> {
    println!("Finding csi-certify namespaces...");

    let nsapi: Api<Namespace> = Api::all(client);
    let nslist = nsapi.list(&ListParams::default()).await?;

    Ok(nslist
        .iter()
        .map(name_of)
        .filter(|n| n.starts_with(TEST_NS_PREFIX))
        .collect())
}

/// Cluster scoped objects carry the test namespace as a name suffix.
async fn list_left_over<K>(client: kube::Client) -> anyhow::Result<Vec<String>>
where
    K: kube::Resource<DynamicType = ()> + Metadata<Ty = ObjectMeta> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let api: Api<K> = Api::all(client);
    let list = api.list(&ListParams::default()).await?;
    let marker = format!("-{}", TEST_NS_PREFIX);

    Ok(list
        .iter()
        .map(name_of)
        .filter(|n| n.contains(&marker))
        .collect())
}

fn name_of(object: &impl Metadata<Ty = ObjectMeta>) -> String {
    object.metadata().name.clone().unwrap_or_default()
}

async fn smite_namespace_pods(client: kube::Client, namespace: &str) -> anyhow::Result<()> {
    println!("Finding pods in namespace {}...", namespace);

    let podapi: Api<Pod> = Api::namespaced(client, namespace);
    let pods = podapi.list(&ListParams::default()).await?;

    println!("Deleting pods in namespace {}...", namespace);

    let delete_operations = pods.iter().map(|p| smite_pod(&podapi, p));
    let errors = errors_of(futures::future::join_all(delete_operations).await);

    if !errors.is_empty() {
        return Err(smite_pods_failure_error(namespace, &errors));
    }

    Ok(())
}

async fn smite_pod(podapi: &Api<Pod>, pod: &Pod) -> anyhow::Result<()> {
    let pod_name = name_of(pod);
    let _ = podapi
        .delete(
            &pod_name,
            &DeleteParams {
                grace_period_seconds: Some(0),
                ..DeleteParams::default()
            },
        )
        .await?;
    Ok(())
}

async fn smite<K>(client: kube::Client, name: &str) -> anyhow::Result<()>
where
    K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    let api: Api<K> = Api::all(client);
    api.delete(name, &DeleteParams::default())
        .await
        .map_err(|e| anyhow::anyhow!("{} {}: {}", K::kind(&()), name, e))?;
    Ok(())
}

fn errors_of(results: Vec<anyhow::Result<()>>) -> Vec<anyhow::Error> {
    results.into_iter().filter_map(Result::err).collect()
}

fn smite_failure_error(errors: &[anyhow::Error]) -> anyhow::Error {
    let message_list = errors
        .iter()
        .map(|e| format!("{}", e))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::anyhow!(
        "Some certification resources were not cleaned up:\n{}",
        message_list
    )
}

fn smite_pods_failure_error(namespace: &str, errors: &[anyhow::Error]) -> anyhow::Error {
    let message_list = errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n");
    anyhow::anyhow!(
        "- Namespace {}: pod delete(s) failed:\n{}",
        namespace,
        message_list
    )
}

fn confirm_smite(names: &[String]) -> bool {
    println!(
        "Smite these namespaces and cluster objects and all resources within them: {}? (y/n) ",
        names.join(", ")
    );
    let mut response = String::new();
    match std::io::stdin().read_line(&mut response) {
        Err(e) => {
            eprintln!("Error reading response: {}", e);
            confirm_smite(names)
        }
        Ok(_) => response.starts_with('y') || response.starts_with('Y'),
    }
}
