//! Drives the compiler and applier for one pod at a time
//!
//! Applies are serialized per pod; distinct pods proceed in parallel on their
//! own tasks. Every policy yields its own table per interface, so layered
//! policies coexist and are removed independently.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use mnp_core::types::{ClusterSnapshot, CommonRules, Pod, Policy};
use mnp_core::{identity_prefix, Result};
use mnp_netns::PacketFilter;
use mnp_policy::render_table;

use crate::datastore::Datastore;
use crate::runtime::RuntimeResolver;

type PodKey = (String, String);
type PolicyKey = (String, String);

pub struct Orchestrator {
    datastore: Arc<Datastore>,
    resolver: Arc<dyn RuntimeResolver>,
    filter: Arc<dyn PacketFilter>,
    common_rules: CommonRules,
    allowed_plugins: Vec<String>,
    pod_locks: Mutex<HashMap<PodKey, Arc<Mutex<()>>>>,
    /// Policy identity -> pods (and their netns) holding its tables.
    installed: Mutex<HashMap<PolicyKey, HashMap<PodKey, PathBuf>>>,
}

impl Orchestrator {
    pub fn new(
        datastore: Arc<Datastore>,
        resolver: Arc<dyn RuntimeResolver>,
        filter: Arc<dyn PacketFilter>,
        common_rules: CommonRules,
        allowed_plugins: Vec<String>,
    ) -> Self {
        Self {
            datastore,
            resolver,
            filter,
            common_rules,
            allowed_plugins,
            pod_locks: Mutex::new(HashMap::new()),
            installed: Mutex::new(HashMap::new()),
        }
    }

    async fn pod_lock(&self, key: &PodKey) -> Arc<Mutex<()>> {
        let mut locks = self.pod_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    fn plugin_allowed(&self, snapshot: &ClusterSnapshot, network: &str) -> bool {
        snapshot
            .network_plugins
            .get(network)
            .map(|plugin| self.allowed_plugins.iter().any(|allowed| allowed == plugin))
            .unwrap_or(false)
    }

    /// Install the tables of one policy on one pod.
    pub async fn enforce(&self, pod: &Pod, policy: &Policy) -> Result<()> {
        let lock = self.pod_lock(&pod.key()).await;
        let _guard = lock.lock().await;
        let snapshot = self.datastore.snapshot().await;
        self.enforce_locked(&snapshot, pod, policy).await
    }

    async fn enforce_locked(
        &self,
        snapshot: &ClusterSnapshot,
        pod: &Pod,
        policy: &Policy,
    ) -> Result<()> {
        let interfaces: Vec<_> = pod
            .interfaces
            .iter()
            .filter(|iface| policy.applies_to_network(&iface.network))
            .filter(|iface| self.plugin_allowed(snapshot, &iface.network))
            .collect();
        if interfaces.is_empty() {
            debug!(
                "Policy {}/{} selects no interface of pod {}/{}",
                policy.namespace, policy.name, pod.namespace, pod.name
            );
            return Ok(());
        }

        let netns = self.resolver.netns_path(pod).await?;

        // Record the target before installing so cleanup still finds
        // partially applied interfaces after a failure.
        self.installed
            .lock()
            .await
            .entry(policy.key())
            .or_default()
            .insert(pod.key(), netns.clone());

        for iface in interfaces {
            let table = render_table(snapshot, &self.common_rules, policy, pod, iface);
            self.filter.install(&netns, &table.name, &table.text).await?;
            info!(
                "Installed {} for pod {}/{}",
                table.name, pod.namespace, pod.name
            );
        }
        Ok(())
    }

    /// Apply the full set of policies currently selecting `pod`, removing
    /// tables of policies that stopped selecting it.
    pub async fn apply_pod(&self, pod: &Pod, policies: &[Policy]) -> Result<()> {
        let pod_key = pod.key();
        let lock = self.pod_lock(&pod_key).await;
        let _guard = lock.lock().await;
        let snapshot = self.datastore.snapshot().await;

        let current: BTreeSet<PolicyKey> = policies.iter().map(|p| p.key()).collect();
        let stale: Vec<(PolicyKey, PathBuf)> = {
            let installed = self.installed.lock().await;
            installed
                .iter()
                .filter(|(key, _)| !current.contains(*key))
                .filter_map(|(key, pods)| {
                    pods.get(&pod_key).map(|netns| (key.clone(), netns.clone()))
                })
                .collect()
        };
        for (policy_key, netns) in stale {
            if netns.exists() {
                let prefix = identity_prefix(&policy_key.0, &policy_key.1);
                self.filter.remove_matching(&netns, &prefix).await?;
            }
            let mut installed = self.installed.lock().await;
            if let Some(entry) = installed.get_mut(&policy_key) {
                entry.remove(&pod_key);
                if entry.is_empty() {
                    installed.remove(&policy_key);
                }
            }
        }

        for policy in policies {
            self.enforce_locked(&snapshot, pod, policy).await?;
        }
        Ok(())
    }

    /// Remove every table of the policy identity, in every netns known to
    /// hold one. A netns that disappeared with its pod is skipped.
    pub async fn cleanup(&self, policy_namespace: &str, policy_name: &str) -> Result<()> {
        let key = (policy_namespace.to_string(), policy_name.to_string());
        let prefix = identity_prefix(policy_namespace, policy_name);

        let targets: Vec<(PodKey, PathBuf)> = {
            let installed = self.installed.lock().await;
            installed
                .get(&key)
                .map(|pods| {
                    pods.iter()
                        .map(|(pod, netns)| (pod.clone(), netns.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (pod_key, netns) in targets {
            let lock = self.pod_lock(&pod_key).await;
            let _guard = lock.lock().await;
            if netns.exists() {
                self.filter.remove_matching(&netns, &prefix).await?;
            }
            let mut installed = self.installed.lock().await;
            if let Some(entry) = installed.get_mut(&key) {
                entry.remove(&pod_key);
                if entry.is_empty() {
                    installed.remove(&key);
                }
            }
        }
        info!("Cleaned up policy {}/{}", policy_namespace, policy_name);
        Ok(())
    }

    /// Drop all bookkeeping for a pod that left the node; its netns and
    /// tables are gone with it.
    pub async fn forget_pod(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        let mut installed = self.installed.lock().await;
        installed.retain(|_, pods| {
            pods.remove(&key);
            !pods.is_empty()
        });
        drop(installed);
        self.pod_locks.lock().await.remove(&key);
    }
}
