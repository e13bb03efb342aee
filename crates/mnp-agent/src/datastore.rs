//! In-memory store of cluster objects
//!
//! Writers install a fresh snapshot; readers hold an `Arc` to an immutable
//! one for the duration of an apply, so the watch layer can never mutate a
//! snapshot in flight.

use std::sync::Arc;
use tokio::sync::RwLock;

use mnp_core::types::{ClusterSnapshot, Namespace, Pod, Policy};

#[derive(Default)]
pub struct Datastore {
    inner: RwLock<Arc<ClusterSnapshot>>,
}

impl Datastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Immutable view of the current cluster state.
    pub async fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.inner.read().await.clone()
    }

    async fn update(&self, mutate: impl FnOnce(&mut ClusterSnapshot)) {
        let mut guard = self.inner.write().await;
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    pub async fn upsert_pod(&self, pod: Pod) {
        self.update(|snap| {
            snap.pods.insert(pod.key(), pod);
        })
        .await;
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.update(|snap| {
            snap.pods.remove(&key);
        })
        .await;
    }

    pub async fn upsert_namespace(&self, namespace: Namespace) {
        self.update(|snap| {
            snap.namespaces.insert(namespace.name.clone(), namespace);
        })
        .await;
    }

    pub async fn remove_namespace(&self, name: &str) {
        let name = name.to_string();
        self.update(|snap| {
            snap.namespaces.remove(&name);
        })
        .await;
    }

    pub async fn upsert_policy(&self, policy: Policy) {
        self.update(|snap| {
            snap.policies.insert(policy.key(), policy);
        })
        .await;
    }

    pub async fn remove_policy(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        self.update(|snap| {
            snap.policies.remove(&key);
        })
        .await;
    }

    pub async fn set_network_plugin(&self, network: &str, plugin: &str) {
        let network = network.to_string();
        let plugin = plugin.to_string();
        self.update(|snap| {
            snap.network_plugins.insert(network, plugin);
        })
        .await;
    }

    pub async fn remove_network_plugin(&self, network: &str) {
        let network = network.to_string();
        self.update(|snap| {
            snap.network_plugins.remove(&network);
        })
        .await;
    }
}

/// Policies selecting the given pod, in (namespace, name) order.
pub fn policies_for_pod<'a>(snapshot: &'a ClusterSnapshot, pod: &Pod) -> Vec<&'a Policy> {
    if !pod.is_eligible() {
        return Vec::new();
    }
    snapshot
        .policies
        .values()
        .filter(|policy| policy.namespace == pod.namespace)
        .filter(|policy| policy.pod_selector.matches(&pod.labels))
        .collect()
}
