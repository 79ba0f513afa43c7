//! Copies the output of every pod in the test namespace into the log.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube_runtime::watcher::{watcher, Event};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Streams container logs for as long as it is alive. Dropping the watcher
/// or calling [`PodLogWatcher::stop`] ends every stream.
pub struct PodLogWatcher {
    namespace: String,
    handle: JoinHandle<()>,
    streams: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl PodLogWatcher {
    pub fn start(client: kube::Client, namespace: &str) -> Self {
        let streams = Arc::new(Mutex::new(Vec::new()));
        let handle = tokio::spawn(watch_pods(
            client,
            namespace.to_owned(),
            Arc::clone(&streams),
        ));
        debug!(namespace, "Started pod log watcher");
        PodLogWatcher {
            namespace: namespace.to_owned(),
            handle,
            streams,
        }
    }

    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for PodLogWatcher {
    fn drop(&mut self) {
        self.handle.abort();
        if let Ok(mut streams) = self.streams.lock() {
            for stream in streams.drain(..) {
                stream.abort();
            }
        }
        debug!(namespace = %self.namespace, "Stopped pod log watcher");
    }
}

async fn watch_pods(
    client: kube::Client,
    namespace: String,
    streams: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
    let mut started = HashSet::new();
    let mut events = watcher(api, ListParams::default()).boxed();
    loop {
        let event = match events.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, %namespace, "Pod watch failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };
        let pods = match event {
            Event::Applied(pod) => vec![pod],
            Event::Restarted(pods) => pods,
            Event::Deleted(_) => continue,
        };
        for pod in pods {
            for (pod_name, container) in running_containers(&pod) {
                if !started.insert((pod_name.clone(), container.clone())) {
                    continue;
                }
                info!(pod = %pod_name, %container, "Streaming container output");
                let handle = tokio::spawn(stream_logs(
                    client.clone(),
                    namespace.clone(),
                    pod_name,
                    container,
                ));
                if let Ok(mut streams) = streams.lock() {
                    streams.push(handle);
                }
            }
        }
    }
}

/// Containers of the pod that have started and can be followed.
fn running_containers(pod: &Pod) -> Vec<(String, String)> {
    let pod_name = pod.metadata.name.clone().unwrap_or_default();
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter(|s| {
                    s.state
                        .as_ref()
                        .map(|state| state.running.is_some() || state.terminated.is_some())
                        .unwrap_or(false)
                })
                .map(|s| (pod_name.clone(), s.name.clone()))
                .collect()
        })
        .unwrap_or_default()
}

async fn stream_logs(client: kube::Client, namespace: String, pod: String, container: String) {
    let api: Api<Pod> = Api::namespaced(client, &namespace);
    let params = LogParams {
        container: Some(container.clone()),
        follow: true,
        ..Default::default()
    };
    let mut logs = match api.log_stream(&pod, &params).await {
        Ok(logs) => logs.boxed(),
        Err(e) => {
            warn!(error = %e, %pod, %container, "Unable to stream logs");
            return;
        }
    };
    loop {
        match logs.try_next().await {
            Ok(Some(chunk)) => {
                for line in String::from_utf8_lossy(&chunk).lines() {
                    info!(target: "pod", %pod, %container, "{}", line);
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, %pod, %container, "Log stream ended");
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_started_containers_are_streamed() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "csi-hostpathplugin-0"},
            "status": {"containerStatuses": [
                {"name": "hostpath", "ready": true, "restartCount": 0, "image": "i", "imageID": "",
                 "state": {"running": {}}},
                {"name": "csi-attacher", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
                 "state": {"waiting": {"reason": "ContainerCreating"}}},
                {"name": "init", "ready": false, "restartCount": 0, "image": "i", "imageID": "",
                 "state": {"terminated": {"exitCode": 0}}}
            ]}
        }))
        .unwrap();
        assert_eq!(
            running_containers(&pod),
            vec![
                ("csi-hostpathplugin-0".to_owned(), "hostpath".to_owned()),
                ("csi-hostpathplugin-0".to_owned(), "init".to_owned())
            ]
        );
    }
}
