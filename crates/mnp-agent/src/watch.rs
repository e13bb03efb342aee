//! Cluster watch loops feeding the datastore and orchestrator

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace as K8sNamespace, Pod as K8sPod};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, warn};

use mnp_core::annotations::{parse_interfaces, NETWORKS_ANNOTATION, NETWORK_STATUS_ANNOTATION};
use mnp_core::types::{Namespace, Pod};

use crate::crd::{self, MultiNetworkPolicy, NetworkAttachmentDefinition};
use crate::datastore::{policies_for_pod, Datastore};
use crate::orchestrator::Orchestrator;

struct WatchContext {
    datastore: Arc<Datastore>,
    orchestrator: Arc<Orchestrator>,
    node_name: String,
}

/// Run all watch loops until the first one terminates.
pub async fn run(
    client: Client,
    datastore: Arc<Datastore>,
    orchestrator: Arc<Orchestrator>,
    node_name: String,
) -> Result<()> {
    let ctx = Arc::new(WatchContext {
        datastore,
        orchestrator,
        node_name,
    });
    tokio::try_join!(
        watch_policies(client.clone(), ctx.clone()),
        watch_pods(client.clone(), ctx.clone()),
        watch_namespaces(client.clone(), ctx.clone()),
        watch_attachments(client, ctx),
    )?;
    Ok(())
}

/// Re-apply every local target pod against the policies now selecting it.
///
/// Pod, namespace, and policy changes anywhere in the cluster can shift peer
/// IP sets, so each event re-evaluates the node's own pods.
async fn resync_local_pods(ctx: &Arc<WatchContext>) {
    let snapshot = ctx.datastore.snapshot().await;
    for pod in snapshot.pods.values() {
        if pod.node_name != ctx.node_name || !pod.is_eligible() {
            continue;
        }
        let policies: Vec<_> = policies_for_pod(&snapshot, pod)
            .into_iter()
            .cloned()
            .collect();
        let orchestrator = ctx.orchestrator.clone();
        let pod = pod.clone();
        tokio::spawn(async move {
            if let Err(e) = orchestrator.apply_pod(&pod, &policies).await {
                warn!(
                    "Failed to apply policies to pod {}/{}: {}",
                    pod.namespace, pod.name, e
                );
            }
        });
    }
}

async fn watch_policies(client: Client, ctx: Arc<WatchContext>) -> Result<()> {
    let api: Api<MultiNetworkPolicy> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => handle_policy_applied(&ctx, &obj).await,
            Ok(watcher::Event::Deleted(obj)) => handle_policy_deleted(&ctx, &obj).await,
            Ok(watcher::Event::Restarted(objs)) => {
                for obj in &objs {
                    handle_policy_applied(&ctx, obj).await;
                }
            }
            Err(e) => warn!("MultiNetworkPolicy watch error: {}", e),
        }
    }
    Ok(())
}

async fn handle_policy_applied(ctx: &Arc<WatchContext>, obj: &MultiNetworkPolicy) {
    match crd::to_policy(obj) {
        Ok(policy) => {
            debug!("Storing policy {}/{}", policy.namespace, policy.name);
            ctx.datastore.upsert_policy(policy).await;
            resync_local_pods(ctx).await;
        }
        Err(e) => warn!(
            "Ignoring policy {}/{}: {}",
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            e
        ),
    }
}

async fn handle_policy_deleted(ctx: &Arc<WatchContext>, obj: &MultiNetworkPolicy) {
    let namespace = obj.namespace().unwrap_or_default();
    let name = obj.name_any();
    ctx.datastore.remove_policy(&namespace, &name).await;
    if let Err(e) = ctx.orchestrator.cleanup(&namespace, &name).await {
        warn!("Cleanup of policy {}/{} failed: {}", namespace, name, e);
    }
}

async fn watch_pods(client: Client, ctx: Arc<WatchContext>) -> Result<()> {
    let api: Api<K8sPod> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => handle_pod_applied(&ctx, &obj).await,
            Ok(watcher::Event::Deleted(obj)) => {
                let namespace = obj.namespace().unwrap_or_default();
                let name = obj.name_any();
                ctx.datastore.remove_pod(&namespace, &name).await;
                ctx.orchestrator.forget_pod(&namespace, &name).await;
                resync_local_pods(&ctx).await;
            }
            Ok(watcher::Event::Restarted(objs)) => {
                for obj in &objs {
                    handle_pod_applied(&ctx, obj).await;
                }
            }
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }
    Ok(())
}

async fn handle_pod_applied(ctx: &Arc<WatchContext>, obj: &K8sPod) {
    match convert_pod(obj) {
        Ok(pod) => {
            ctx.datastore.upsert_pod(pod).await;
            resync_local_pods(ctx).await;
        }
        Err(e) => warn!(
            "Ignoring pod {}/{}: {}",
            obj.namespace().unwrap_or_default(),
            obj.name_any(),
            e
        ),
    }
}

async fn watch_namespaces(client: Client, ctx: Arc<WatchContext>) -> Result<()> {
    let api: Api<K8sNamespace> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => {
                ctx.datastore
                    .upsert_namespace(Namespace {
                        name: obj.name_any(),
                        labels: obj.labels().clone(),
                    })
                    .await;
                resync_local_pods(&ctx).await;
            }
            Ok(watcher::Event::Deleted(obj)) => {
                ctx.datastore.remove_namespace(&obj.name_any()).await;
                resync_local_pods(&ctx).await;
            }
            Ok(watcher::Event::Restarted(objs)) => {
                for obj in objs {
                    ctx.datastore
                        .upsert_namespace(Namespace {
                            name: obj.name_any(),
                            labels: obj.labels().clone(),
                        })
                        .await;
                }
                resync_local_pods(&ctx).await;
            }
            Err(e) => warn!("Namespace watch error: {}", e),
        }
    }
    Ok(())
}

async fn watch_attachments(client: Client, ctx: Arc<WatchContext>) -> Result<()> {
    let api: Api<NetworkAttachmentDefinition> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default()).boxed();
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => {
                handle_attachment_applied(&ctx, &obj).await;
                resync_local_pods(&ctx).await;
            }
            Ok(watcher::Event::Deleted(obj)) => {
                let network = attachment_network(&obj);
                ctx.datastore.remove_network_plugin(&network).await;
                resync_local_pods(&ctx).await;
            }
            Ok(watcher::Event::Restarted(objs)) => {
                for obj in &objs {
                    handle_attachment_applied(&ctx, obj).await;
                }
                resync_local_pods(&ctx).await;
            }
            Err(e) => warn!("NetworkAttachmentDefinition watch error: {}", e),
        }
    }
    Ok(())
}

fn attachment_network(obj: &NetworkAttachmentDefinition) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

async fn handle_attachment_applied(ctx: &Arc<WatchContext>, obj: &NetworkAttachmentDefinition) {
    let network = attachment_network(obj);
    match crd::plugin_type(obj) {
        Some(plugin) => ctx.datastore.set_network_plugin(&network, &plugin).await,
        None => {
            debug!("Attachment {} declares no plugin type", network);
            ctx.datastore.remove_network_plugin(&network).await;
        }
    }
}

/// Convert an API pod into the compiler's model.
pub fn convert_pod(obj: &K8sPod) -> mnp_core::Result<Pod> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    let uid = obj.uid().unwrap_or_default();

    let spec = obj.spec.clone().unwrap_or_default();
    let host_network = spec.host_network.unwrap_or(false);
    let node_name = spec.node_name.unwrap_or_default();
    let running = obj
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");

    let annotations = obj.annotations();
    let interfaces = match (
        annotations.get(NETWORKS_ANNOTATION),
        annotations.get(NETWORK_STATUS_ANNOTATION),
    ) {
        (Some(networks), Some(status)) => parse_interfaces(&namespace, networks, status)?,
        _ => Vec::new(),
    };

    let mut container_ports = Vec::new();
    for container in &spec.containers {
        for port in container.ports.iter().flatten() {
            let Ok(number) = u16::try_from(port.container_port) else {
                warn!(
                    "Skipping out-of-range container port {} on pod {}/{}",
                    port.container_port, namespace, name
                );
                continue;
            };
            let protocol = match port.protocol.as_deref().unwrap_or("TCP").parse() {
                Ok(protocol) => protocol,
                Err(e) => {
                    warn!("Skipping container port on pod {}/{}: {}", namespace, name, e);
                    continue;
                }
            };
            container_ports.push(mnp_core::types::ContainerPort {
                name: port.name.clone(),
                port: number,
                protocol,
            });
        }
    }

    Ok(Pod {
        namespace,
        name,
        uid,
        node_name,
        labels: obj.labels().clone(),
        host_network,
        running,
        interfaces,
        container_ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    #[test]
    fn test_convert_pod() {
        let obj = K8sPod {
            metadata: ObjectMeta {
                name: Some("sample".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-sample".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "sample".to_string())])),
                annotations: Some(BTreeMap::from([
                    (NETWORKS_ANNOTATION.to_string(), "red-net".to_string()),
                    (
                        NETWORK_STATUS_ANNOTATION.to_string(),
                        r#"[{"name": "red-net", "interface": "net1", "ips": ["10.1.1.1"]}]"#
                            .to_string(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node1".to_string()),
                containers: vec![Container {
                    name: "main".to_string(),
                    ports: Some(vec![ContainerPort {
                        name: Some("https".to_string()),
                        container_port: 8443,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };

        let pod = convert_pod(&obj).unwrap();
        assert!(pod.running);
        assert!(!pod.host_network);
        assert_eq!(pod.node_name, "node1");
        assert_eq!(pod.interfaces.len(), 1);
        assert_eq!(pod.interfaces[0].network, "default/red-net");
        assert_eq!(pod.container_ports.len(), 1);
        assert_eq!(pod.container_ports[0].port, 8443);
        assert!(pod.is_eligible());
    }

    #[test]
    fn test_convert_pod_without_attachments() {
        let obj = K8sPod {
            metadata: ObjectMeta {
                name: Some("plain".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let pod = convert_pod(&obj).unwrap();
        assert!(pod.interfaces.is_empty());
        assert!(!pod.is_eligible());
    }
}
