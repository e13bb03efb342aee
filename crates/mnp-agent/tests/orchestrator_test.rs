//! Lifecycle tests for the policy orchestrator against an in-memory filter

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use mnp_agent::{Datastore, Orchestrator, RuntimeResolver};
use mnp_core::types::{
    Interface, IpBlock, LabelSelector, Namespace, Peer, Pod, Policy, PolicyType, Rule,
};
use mnp_core::Result;
use mnp_netns::PacketFilter;

/// Packet filter recording tables per (netns, name) without touching a kernel.
#[derive(Default)]
struct MemoryFilter {
    tables: Mutex<BTreeMap<(PathBuf, String), String>>,
}

impl MemoryFilter {
    async fn names(&self, netns: &Path) -> Vec<String> {
        self.tables
            .lock()
            .await
            .keys()
            .filter(|(ns, _)| ns == netns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    async fn payloads(&self, netns: &Path) -> Vec<String> {
        self.tables
            .lock()
            .await
            .iter()
            .filter(|((ns, _), _)| ns == netns)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    async fn seed(&self, netns: &Path, name: &str, payload: &str) {
        self.tables
            .lock()
            .await
            .insert((netns.to_path_buf(), name.to_string()), payload.to_string());
    }
}

#[async_trait]
impl PacketFilter for MemoryFilter {
    async fn install(&self, netns: &Path, table: &str, payload: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .insert((netns.to_path_buf(), table.to_string()), payload.to_string());
        Ok(())
    }

    async fn remove_matching(&self, netns: &Path, prefix: &str) -> Result<()> {
        self.tables
            .lock()
            .await
            .retain(|(ns, name), _| !(ns == netns && name.starts_with(prefix)));
        Ok(())
    }
}

struct FixedResolver {
    path: PathBuf,
}

#[async_trait]
impl RuntimeResolver for FixedResolver {
    async fn netns_path(&self, _pod: &Pod) -> Result<PathBuf> {
        Ok(self.path.clone())
    }
}

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn target_pod(interfaces: Vec<Interface>) -> Pod {
    Pod {
        namespace: "default".to_string(),
        name: "target-pod".to_string(),
        uid: "uid-target".to_string(),
        node_name: "node1".to_string(),
        labels: labels(&[("app", "sample")]),
        host_network: false,
        running: true,
        interfaces,
        container_ports: Vec::new(),
    }
}

fn iface(name: &str, network: &str, ip: &str) -> Interface {
    Interface {
        name: name.to_string(),
        network: network.to_string(),
        ips: vec![ip.parse().unwrap()],
    }
}

fn policy(name: &str, networks: &[&str], ingress: Vec<Rule>) -> Policy {
    Policy {
        namespace: "default".to_string(),
        name: name.to_string(),
        pod_selector: LabelSelector {
            match_labels: labels(&[("app", "sample")]),
            match_expressions: Vec::new(),
        },
        networks: networks.iter().map(|n| n.to_string()).collect(),
        policy_types: vec![PolicyType::Ingress, PolicyType::Egress],
        ingress,
        egress: Vec::new(),
    }
}

struct Fixture {
    orchestrator: Orchestrator,
    filter: Arc<MemoryFilter>,
    netns: PathBuf,
    _netns_dir: tempfile::TempDir,
}

async fn fixture(target: &Pod) -> Fixture {
    let netns_dir = tempfile::tempdir().unwrap();
    let netns = netns_dir.path().join("pod-netns");
    std::fs::write(&netns, "").unwrap();

    let datastore = Arc::new(Datastore::new());
    datastore
        .upsert_namespace(Namespace {
            name: "default".to_string(),
            labels: BTreeMap::new(),
        })
        .await;
    datastore.upsert_pod(target.clone()).await;
    datastore.set_network_plugin("default/red-net", "macvlan").await;
    datastore.set_network_plugin("default/blue-net", "macvlan").await;

    let filter = Arc::new(MemoryFilter::default());
    let resolver = Arc::new(FixedResolver {
        path: netns.clone(),
    });
    let orchestrator = Orchestrator::new(
        datastore,
        resolver,
        filter.clone(),
        Default::default(),
        vec!["macvlan".to_string()],
    );

    Fixture {
        orchestrator,
        filter,
        netns,
        _netns_dir: netns_dir,
    }
}

#[tokio::test]
async fn test_layering_and_cleanup() {
    let target = target_pod(vec![iface("eth1", "default/red-net", "10.1.1.5")]);
    let fx = fixture(&target).await;

    let deny_all = policy("deny-all", &["default/red-net"], Vec::new());
    let comprehensive = policy(
        "comprehensive",
        &["default/red-net"],
        vec![Rule {
            peers: vec![Peer::IpBlock(IpBlock {
                cidr: "10.0.0.0/8".to_string(),
                except: Vec::new(),
            })],
            ports: Vec::new(),
        }],
    );

    fx.orchestrator
        .apply_pod(&target, &[deny_all.clone(), comprehensive.clone()])
        .await
        .unwrap();

    let mut names = fx.filter.names(&fx.netns).await;
    names.sort();
    assert_eq!(
        names,
        vec!["mnp-default-comprehensive-eth1", "mnp-default-deny-all-eth1"]
    );

    fx.orchestrator.cleanup("default", "comprehensive").await.unwrap();

    assert_eq!(fx.filter.names(&fx.netns).await, vec!["mnp-default-deny-all-eth1"]);
    let payloads = fx.filter.payloads(&fx.netns).await;
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0], include_str!("golden/lifecycle-after-cleanup.nft"));
}

#[tokio::test]
async fn test_cleanup_without_matching_tables_succeeds() {
    let target = target_pod(vec![iface("eth1", "default/red-net", "10.1.1.5")]);
    let fx = fixture(&target).await;

    // Nothing was ever installed for this identity.
    fx.orchestrator.cleanup("default", "ghost-policy").await.unwrap();
    assert!(fx.filter.names(&fx.netns).await.is_empty());

    // A bare netns with no matching tables is also a successful no-op.
    fx.filter
        .remove_matching(&fx.netns, "mnp-default-ghost-policy-")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reapply_replaces_instead_of_duplicating() {
    let target = target_pod(vec![iface("eth1", "default/red-net", "10.1.1.5")]);
    let fx = fixture(&target).await;
    let deny_all = policy("deny-all", &["default/red-net"], Vec::new());

    fx.orchestrator.enforce(&target, &deny_all).await.unwrap();
    fx.orchestrator.enforce(&target, &deny_all).await.unwrap();

    assert_eq!(fx.filter.names(&fx.netns).await.len(), 1);
}

#[tokio::test]
async fn test_only_listed_networks_receive_rules() {
    let target = target_pod(vec![
        iface("eth1", "default/red-net", "10.1.1.5"),
        iface("eth2", "default/blue-net", "10.2.2.5"),
    ]);
    let fx = fixture(&target).await;
    let red_only = policy("red-only", &["default/red-net"], Vec::new());

    fx.orchestrator.enforce(&target, &red_only).await.unwrap();

    let names = fx.filter.names(&fx.netns).await;
    assert_eq!(names, vec!["mnp-default-red-only-eth1"]);
}

#[tokio::test]
async fn test_unknown_plugin_network_skipped() {
    let target = target_pod(vec![iface("eth1", "default/unmanaged-net", "10.9.9.5")]);
    let fx = fixture(&target).await;
    let pol = policy("unmanaged", &["default/unmanaged-net"], Vec::new());

    fx.orchestrator.enforce(&target, &pol).await.unwrap();
    assert!(fx.filter.names(&fx.netns).await.is_empty());
}

#[tokio::test]
async fn test_foreign_tables_left_alone() {
    let target = target_pod(vec![iface("eth1", "default/red-net", "10.1.1.5")]);
    let fx = fixture(&target).await;
    fx.filter
        .seed(&fx.netns, "firewalld", "table inet firewalld {\n}\n")
        .await;

    let deny_all = policy("deny-all", &["default/red-net"], Vec::new());
    fx.orchestrator.enforce(&target, &deny_all).await.unwrap();
    fx.orchestrator.cleanup("default", "deny-all").await.unwrap();

    assert_eq!(fx.filter.names(&fx.netns).await, vec!["firewalld"]);
}

#[tokio::test]
async fn test_apply_pod_removes_stale_policy_tables() {
    let target = target_pod(vec![iface("eth1", "default/red-net", "10.1.1.5")]);
    let fx = fixture(&target).await;

    let deny_all = policy("deny-all", &["default/red-net"], Vec::new());
    let other = policy("other", &["default/red-net"], Vec::new());

    fx.orchestrator
        .apply_pod(&target, &[deny_all.clone(), other])
        .await
        .unwrap();
    assert_eq!(fx.filter.names(&fx.netns).await.len(), 2);

    // The second apply no longer lists "other"; its table must go away.
    fx.orchestrator.apply_pod(&target, &[deny_all]).await.unwrap();
    assert_eq!(fx.filter.names(&fx.netns).await, vec!["mnp-default-deny-all-eth1"]);
}
