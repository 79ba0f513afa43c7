//! Pod, claim and node helpers used by the test suites.
use std::collections::BTreeMap;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::{Api, ListParams, LogParams, PostParams};
use kube_runtime::watcher::{watcher, Event};
use serde_json::json;
use tracing::{debug, info};

use super::resources::{is_not_found, TestResource};
use super::Framework;
use crate::pattern::TestVolMode;

/// Image used for the short lived pods that read and write volumes.
pub const BUSYBOX_IMAGE: &str = "busybox:1.29";

/// How long a pod may take to run to completion.
pub const POD_START_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How long a claim may take to bind.
pub const CLAIM_PROVISION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// How long a released volume may take to go away.
pub const PV_DELETE_TIMEOUT: Duration = Duration::from_secs(20 * 60);
/// Interval between checks for a deleted volume.
pub const PV_DELETE_POLL: Duration = Duration::from_secs(5);

/// Where test pods mount the volume under test.
pub const TEST_MOUNT_PATH: &str = "/mnt/test";

fn named(name: &str) -> ListParams {
    ListParams::default()
        .fields(&format!("metadata.name={}", name))
        .timeout(30)
}

/// Where test pods attach a block volume under test.
pub const TEST_DEVICE_PATH: &str = "/mnt/test-device";

/// How the test pod consumes the claim.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeUse<'a> {
    pub mode: TestVolMode,
    /// Mounts only this path of the volume. Ignored for block volumes.
    pub sub_path: Option<&'a str>,
}

/// A pod that runs `command` in busybox with the claim mounted at
/// [`TEST_MOUNT_PATH`].
pub fn volume_pod(
    name: &str,
    claim_name: &str,
    command: &str,
    node_name: Option<&str>,
) -> anyhow::Result<Pod> {
    volume_pod_using(name, claim_name, command, node_name, VolumeUse::default())
}

/// Like [`volume_pod`], but a block claim is attached at [`TEST_DEVICE_PATH`]
/// and a filesystem claim may be mounted at a sub path.
pub fn volume_pod_using(
    name: &str,
    claim_name: &str,
    command: &str,
    node_name: Option<&str>,
    usage: VolumeUse<'_>,
) -> anyhow::Result<Pod> {
    let mut container = json!({
        "name": "volume-tester",
        "image": BUSYBOX_IMAGE,
        "command": ["/bin/sh"],
        "args": ["-c", command],
    });
    match usage.mode {
        TestVolMode::Block => {
            container["volumeDevices"] = json!([
                {"name": "my-volume", "devicePath": TEST_DEVICE_PATH}
            ]);
        }
        TestVolMode::Filesystem => {
            let mut mount = json!({"name": "my-volume", "mountPath": TEST_MOUNT_PATH});
            if let Some(sub_path) = usage.sub_path {
                mount["subPath"] = json!(sub_path);
            }
            container["volumeMounts"] = json!([mount]);
        }
    }

    let pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
        },
        "spec": {
            "restartPolicy": "Never",
            "nodeName": node_name,
            "containers": [container],
            "volumes": [
                {
                    "name": "my-volume",
                    "persistentVolumeClaim": {
                        "claimName": claim_name,
                        "readOnly": false,
                    },
                }
            ],
        }
    }))?;
    Ok(pod)
}

/// Runs `command` in a pod with the claim mounted, waits for it to succeed
/// and deletes the pod again.
pub async fn run_in_pod_with_volume(
    framework: &mut Framework,
    claim_name: &str,
    pod_name: &str,
    command: &str,
    node_name: Option<&str>,
) -> anyhow::Result<()> {
    run_in_pod_using(
        framework,
        claim_name,
        pod_name,
        command,
        node_name,
        VolumeUse::default(),
    )
    .await
}

pub async fn run_in_pod_using(
    framework: &mut Framework,
    claim_name: &str,
    pod_name: &str,
    command: &str,
    node_name: Option<&str>,
    usage: VolumeUse<'_>,
) -> anyhow::Result<()> {
    let pod = volume_pod_using(pod_name, claim_name, command, node_name, usage)?;
    let pods = create_tracked_pod(framework, &pod, pod_name).await?;

    let result =
        wait_for_pod_success(framework.client(), framework.namespace(), pod_name, POD_START_TIMEOUT)
            .await;
    delete_pod(&pods, pod_name).await?;
    result
}

/// Starts a pod that is expected to fail volume setup, e.g. because its sub
/// path escapes the volume, and checks that it never starts running within
/// `window`.
pub async fn run_in_pod_expecting_no_start(
    framework: &mut Framework,
    claim_name: &str,
    pod_name: &str,
    command: &str,
    node_name: Option<&str>,
    usage: VolumeUse<'_>,
    window: Duration,
) -> anyhow::Result<()> {
    let pod = volume_pod_using(pod_name, claim_name, command, node_name, usage)?;
    let pods = create_tracked_pod(framework, &pod, pod_name).await?;

    let result =
        ensure_pod_never_runs(framework.client(), framework.namespace(), pod_name, window).await;
    delete_pod(&pods, pod_name).await?;
    result
}

async fn create_tracked_pod(
    framework: &mut Framework,
    pod: &Pod,
    pod_name: &str,
) -> anyhow::Result<Api<Pod>> {
    let pods: Api<Pod> = Api::namespaced(framework.client(), framework.namespace());
    pods.create(&PostParams::default(), pod).await?;
    framework
        .resources()
        .push(TestResource::Pod(pod_name.to_owned()));
    Ok(pods)
}

async fn delete_pod(pods: &Api<Pod>, pod_name: &str) -> anyhow::Result<()> {
    match pods.delete(pod_name, &Default::default()).await {
        Err(e) if !is_not_found(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

/// Watches the pod for `window` and fails as soon as it runs.
pub async fn ensure_pod_never_runs(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
    window: Duration,
) -> anyhow::Result<()> {
    match tokio::time::timeout(window, watch_pod_started(client, namespace, pod_name)).await {
        Err(_) => Ok(()),
        Ok(Ok(phase)) => Err(anyhow::anyhow!(
            "pod {} reached phase {} but was expected never to start",
            pod_name,
            phase
        )),
        Ok(Err(e)) => Err(e),
    }
}

async fn watch_pod_started(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
) -> anyhow::Result<String> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let mut watcher = watcher(api, named(pod_name)).boxed();
    while let Some(event) = watcher.try_next().await? {
        if let Event::Applied(pod) = event {
            if has_started(&pod) {
                return Ok(pod_phase(&pod).to_owned());
            }
            debug!(pod = pod_name, phase = pod_phase(&pod), "Pod has not started");
        }
    }
    Err(anyhow::anyhow!("watch for pod {} ended", pod_name))
}

fn has_started(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Running" | "Succeeded")
}

/// Waits until the pod terminates. A failed pod is an error carrying the
/// pod's log.
pub async fn wait_for_pod_success(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, watch_pod_success(client, namespace, pod_name))
        .await
        .map_err(|_| anyhow::anyhow!("pod {} did not complete within {:?}", pod_name, timeout))?
}

async fn watch_pod_success(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
) -> anyhow::Result<()> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let mut watcher = watcher(api, named(pod_name)).boxed();
    while let Some(event) = watcher.try_next().await? {
        if let Event::Applied(pod) = event {
            match pod_phase(&pod) {
                "Succeeded" => return Ok(()),
                "Failed" => {
                    let logs = pod_logs(client.clone(), namespace, pod_name).await;
                    anyhow::bail!(
                        "pod {} failed: {}",
                        pod_name,
                        logs.unwrap_or_default().trim()
                    );
                }
                phase => debug!(pod = pod_name, phase, "Waiting for pod to complete"),
            }
        }
    }
    Err(anyhow::anyhow!("watch for pod {} ended", pod_name))
}

/// Waits until the pod is running with every container ready.
pub async fn wait_for_pod_ready(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
    timeout: Duration,
) -> anyhow::Result<Pod> {
    tokio::time::timeout(timeout, watch_pod_ready(client, namespace, pod_name))
        .await
        .map_err(|_| anyhow::anyhow!("pod {} never went ready within {:?}", pod_name, timeout))?
}

async fn watch_pod_ready(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
) -> anyhow::Result<Pod> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let mut watcher = watcher(api, named(pod_name)).boxed();
    while let Some(event) = watcher.try_next().await? {
        if let Event::Applied(pod) = event {
            if is_pod_ready(&pod) {
                return Ok(pod);
            }
            if pod_phase(&pod) == "Failed" {
                anyhow::bail!("pod {} failed before going ready", pod_name);
            }
        }
    }
    Err(anyhow::anyhow!("watch for pod {} ended", pod_name))
}

/// Waits until the pod's log contains `message`.
pub async fn wait_for_pod_log(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
    message: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, poll_pod_log(client, namespace, pod_name, message))
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "pod {} did not log {:?} within {:?}",
                pod_name,
                message,
                timeout
            )
        })?
}

async fn poll_pod_log(
    client: kube::Client,
    namespace: &str,
    pod_name: &str,
    message: &str,
) -> anyhow::Result<()> {
    loop {
        let logs = pod_logs(client.clone(), namespace, pod_name).await?;
        if logs.contains(message) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn pod_logs(client: kube::Client, namespace: &str, pod_name: &str) -> anyhow::Result<String> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    Ok(pods.logs(pod_name, &LogParams::default()).await?)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());
    pod_phase(pod) == "Running"
        && statuses
            .map(|c| !c.is_empty() && c.iter().all(|status| status.ready))
            .unwrap_or(false)
}

/// Waits until the claim is bound and returns it together with its volume.
pub async fn wait_for_pvc_bound(
    client: kube::Client,
    namespace: &str,
    claim_name: &str,
    timeout: Duration,
) -> anyhow::Result<(PersistentVolumeClaim, PersistentVolume)> {
    let claim = tokio::time::timeout(timeout, watch_pvc_bound(client.clone(), namespace, claim_name))
        .await
        .map_err(|_| anyhow::anyhow!("claim {} not bound within {:?}", claim_name, timeout))??;

    let volume_name = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .ok_or_else(|| anyhow::anyhow!("bound claim {} has no volume name", claim_name))?;
    let volume = Api::<PersistentVolume>::all(client).get(&volume_name).await?;
    info!(claim = claim_name, volume = %volume_name, "Claim bound");
    Ok((claim, volume))
}

async fn watch_pvc_bound(
    client: kube::Client,
    namespace: &str,
    claim_name: &str,
) -> anyhow::Result<PersistentVolumeClaim> {
    let api: Api<PersistentVolumeClaim> = Api::namespaced(client, namespace);
    let mut watcher = watcher(api, named(claim_name)).boxed();
    while let Some(event) = watcher.try_next().await? {
        if let Event::Applied(claim) = event {
            let phase = claim
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or_default();
            if phase == "Bound" {
                return Ok(claim);
            }
        }
    }
    Err(anyhow::anyhow!("watch for claim {} ended", claim_name))
}

/// Polls until the volume is gone.
pub async fn wait_for_pv_deleted(
    client: kube::Client,
    volume_name: &str,
    poll: Duration,
    timeout: Duration,
) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, poll_pv_deleted(client, volume_name, poll))
        .await
        .map_err(|_| anyhow::anyhow!("volume {} still exists after {:?}", volume_name, timeout))?
}

async fn poll_pv_deleted(client: kube::Client, volume_name: &str, poll: Duration) -> anyhow::Result<()> {
    let api: Api<PersistentVolume> = Api::all(client);
    loop {
        match api.get(volume_name).await {
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(e.into()),
            Ok(pv) => {
                let phase = pv.status.and_then(|s| s.phase).unwrap_or_default();
                debug!(volume = volume_name, %phase, "Waiting for volume deletion");
            }
        }
        tokio::time::sleep(poll).await;
    }
}

/// Nodes that are ready and accept new pods.
pub async fn ready_schedulable_nodes(client: kube::Client) -> anyhow::Result<Vec<Node>> {
    let nodes = Api::<Node>::all(client)
        .list(&ListParams::default())
        .await?;
    let ready: Vec<_> = nodes
        .items
        .into_iter()
        .filter(is_ready_schedulable)
        .collect();
    if ready.is_empty() {
        anyhow::bail!("no ready schedulable nodes in the cluster");
    }
    Ok(ready)
}

pub fn is_ready_schedulable(node: &Node) -> bool {
    let spec = node.spec.as_ref();
    if spec.and_then(|s| s.unschedulable).unwrap_or(false) {
        return false;
    }
    let tainted = spec
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        })
        .unwrap_or(false);
    if tainted {
        return false;
    }
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// A pod serving storage to the test, e.g. an NFS server.
#[derive(Clone, Debug)]
pub struct StorageServerConfig {
    pub prefix: String,
    pub image: String,
    pub ports: Vec<i32>,
    /// Host path (empty for an emptyDir) to mount path.
    pub volumes: BTreeMap<String, String>,
    /// Logged by the server once it accepts connections.
    pub ready_message: Option<String>,
}

pub fn storage_server_pod(config: &StorageServerConfig) -> anyhow::Result<Pod> {
    let name = format!("{}-server", config.prefix);
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (index, (source, mount_path)) in config.volumes.iter().enumerate() {
        let volume_name = format!("{}-volume-{}", config.prefix, index);
        if source.is_empty() {
            volumes.push(json!({"name": volume_name, "emptyDir": {}}));
        } else {
            volumes.push(json!({"name": volume_name, "hostPath": {"path": source}}));
        }
        mounts.push(json!({"name": volume_name, "mountPath": mount_path}));
    }
    let ports: Vec<_> = config
        .ports
        .iter()
        .map(|p| json!({"containerPort": p}))
        .collect();

    let pod = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "labels": {"role": name},
        },
        "spec": {
            "restartPolicy": "Never",
            "containers": [
                {
                    "name": name,
                    "image": config.image,
                    "securityContext": {"privileged": true},
                    "ports": ports,
                    "volumeMounts": mounts,
                }
            ],
            "volumes": volumes,
        }
    }))?;
    Ok(pod)
}

/// Starts a storage server pod, waits for it to serve and returns the pod
/// with its IP.
pub async fn create_storage_server(
    framework: &Framework,
    config: &StorageServerConfig,
) -> anyhow::Result<(Pod, String)> {
    let pod = storage_server_pod(config)?;
    let name = pod.metadata.name.clone().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(framework.client(), framework.namespace());
    info!(pod = %name, image = %config.image, "Starting storage server");
    pods.create(&PostParams::default(), &pod).await?;

    let pod =
        wait_for_pod_ready(framework.client(), framework.namespace(), &name, POD_START_TIMEOUT)
            .await?;
    if let Some(message) = &config.ready_message {
        wait_for_pod_log(
            framework.client(),
            framework.namespace(),
            &name,
            message,
            POD_START_TIMEOUT,
        )
        .await?;
    }
    let ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.clone())
        .ok_or_else(|| anyhow::anyhow!("storage server {} has no IP", name))?;
    Ok((pod, ip))
}

/// Deletes a storage server pod.
pub async fn clean_up_storage_server(framework: &Framework, pod_name: &str) -> anyhow::Result<()> {
    let pods: Api<Pod> = Api::namespaced(framework.client(), framework.namespace());
    match pods.delete(pod_name, &Default::default()).await {
        Err(e) if !is_not_found(&e) => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(value: serde_json::Value) -> Node {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn ready_untainted_nodes_are_schedulable() {
        let ready = node(json!({
            "metadata": {"name": "n1"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(is_ready_schedulable(&ready));

        let not_ready = node(json!({
            "metadata": {"name": "n2"},
            "status": {"conditions": [{"type": "Ready", "status": "False"}]}
        }));
        assert!(!is_ready_schedulable(&not_ready));

        let cordoned = node(json!({
            "metadata": {"name": "n3"},
            "spec": {"unschedulable": true},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(!is_ready_schedulable(&cordoned));

        let tainted = node(json!({
            "metadata": {"name": "n4"},
            "spec": {"taints": [{"key": "node-role.kubernetes.io/master", "effect": "NoSchedule"}]},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(!is_ready_schedulable(&tainted));

        let soft_taint = node(json!({
            "metadata": {"name": "n5"},
            "spec": {"taints": [{"key": "x", "effect": "PreferNoSchedule"}]},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        }));
        assert!(is_ready_schedulable(&soft_taint));
    }

    #[test]
    fn volume_pod_mounts_the_claim() {
        let pod = volume_pod("writer", "claim-1", "echo hi", Some("node-1")).unwrap();
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-1"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(container.args.as_ref().unwrap()[1], "echo hi");
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].mount_path,
            TEST_MOUNT_PATH
        );
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(
            volume.persistent_volume_claim.as_ref().unwrap().claim_name,
            "claim-1"
        );

        let unpinned = volume_pod("reader", "claim-1", "true", None).unwrap();
        assert!(unpinned.spec.unwrap().node_name.is_none());
    }

    #[test]
    fn block_claims_are_attached_as_devices() {
        let usage = VolumeUse {
            mode: TestVolMode::Block,
            sub_path: Some("ignored"),
        };
        let pod = volume_pod_using("block", "claim-2", "true", None, usage).unwrap();
        let container = &pod.spec.unwrap().containers[0];
        assert!(container.volume_mounts.is_none());
        let devices = container.volume_devices.as_ref().unwrap();
        assert_eq!(devices[0].device_path, TEST_DEVICE_PATH);
        assert_eq!(devices[0].name, "my-volume");
    }

    #[test]
    fn sub_path_is_set_on_the_mount() {
        let usage = VolumeUse {
            sub_path: Some("provisioning"),
            ..Default::default()
        };
        let pod = volume_pod_using("sub", "claim-3", "true", None, usage).unwrap();
        let mounts = pod.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].sub_path.as_deref(), Some("provisioning"));
        assert_eq!(mounts[0].mount_path, TEST_MOUNT_PATH);

        let plain = volume_pod("plain", "claim-3", "true", None).unwrap();
        let mounts = plain.spec.unwrap().containers[0].volume_mounts.clone().unwrap();
        assert!(mounts[0].sub_path.is_none());
    }

    #[test]
    fn only_running_or_finished_pods_have_started() {
        let phase = |phase: &str| -> Pod {
            serde_json::from_value(json!({
                "metadata": {"name": "p"},
                "status": {"phase": phase}
            }))
            .unwrap()
        };
        assert!(!has_started(&phase("Pending")));
        assert!(!has_started(&phase("Failed")));
        assert!(has_started(&phase("Running")));
        assert!(has_started(&phase("Succeeded")));
    }

    #[test]
    fn storage_server_uses_empty_dir_for_empty_source() {
        let mut volumes = BTreeMap::new();
        volumes.insert(String::new(), "/exports".to_owned());
        let pod = storage_server_pod(&StorageServerConfig {
            prefix: "nfs".into(),
            image: "example/nfs:1.0".into(),
            ports: vec![2049],
            volumes,
            ready_message: Some("NFS started".into()),
        })
        .unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("nfs-server"));
        let spec = pod.spec.unwrap();
        let volume = &spec.volumes.unwrap()[0];
        assert!(volume.empty_dir.is_some());
        let container = &spec.containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 2049);
        assert_eq!(
            container
                .security_context
                .as_ref()
                .and_then(|s| s.privileged),
            Some(true)
        );
    }

    #[test]
    fn pod_readiness_needs_running_and_ready_containers() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "p"},
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "c", "ready": true, "restartCount": 0,
                    "image": "i", "imageID": ""
                }]
            }
        }))
        .unwrap();
        assert!(is_pod_ready(&pod));

        let pending: Pod = serde_json::from_value(json!({
            "metadata": {"name": "p"},
            "status": {"phase": "Pending"}
        }))
        .unwrap();
        assert!(!is_pod_ready(&pending));
    }
}
