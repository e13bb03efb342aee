//! Selector evaluation against a cluster snapshot

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use mnp_core::types::{ClusterSnapshot, LabelSelector, Peer, Pod};

/// Peer IPs split by family, sorted within each.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FamilyIps {
    pub v4: Vec<Ipv4Addr>,
    pub v6: Vec<Ipv6Addr>,
}

/// Resolves label selectors to concrete pods and their per-network IPs.
///
/// Pods come back ordered by (namespace, name); the snapshot maps are
/// `BTreeMap`s so iteration order is already the one rule generation needs.
pub struct SelectorEval<'a> {
    snapshot: &'a ClusterSnapshot,
    policy_namespace: &'a str,
}

impl<'a> SelectorEval<'a> {
    pub fn new(snapshot: &'a ClusterSnapshot, policy_namespace: &'a str) -> Self {
        Self {
            snapshot,
            policy_namespace,
        }
    }

    fn namespaces_matching(&self, selector: &LabelSelector) -> BTreeSet<&'a str> {
        self.snapshot
            .namespaces
            .values()
            .filter(|ns| selector.matches(&ns.labels))
            .map(|ns| ns.name.as_str())
            .collect()
    }

    /// Eligible pods a selector peer resolves to. IPBlock peers resolve to no
    /// pods; their addresses come straight from the CIDR.
    pub fn peer_pods(&self, peer: &Peer) -> Vec<&'a Pod> {
        let (pod_selector, scope) = match peer {
            Peer::PodSelector { pods, namespaces } => (Some(pods), namespaces.as_ref()),
            Peer::NamespaceSelector { namespaces } => (None, Some(namespaces)),
            Peer::IpBlock(_) => return Vec::new(),
        };

        // Absent namespace selector scopes to the policy's own namespace,
        // never to all namespaces.
        let in_scope: Option<BTreeSet<&str>> = scope.map(|sel| self.namespaces_matching(sel));

        self.snapshot
            .pods
            .values()
            .filter(|pod| match &in_scope {
                Some(names) => names.contains(pod.namespace.as_str()),
                None => pod.namespace == self.policy_namespace,
            })
            .filter(|pod| pod.is_eligible())
            .filter(|pod| pod_selector.map(|sel| sel.matches(&pod.labels)).unwrap_or(true))
            .collect()
    }

    /// IPs of the peer's pods on the given network, grouped by family.
    pub fn peer_ips(&self, peer: &Peer, network: &str) -> FamilyIps {
        let mut ips = FamilyIps::default();
        for pod in self.peer_pods(peer) {
            for ip in pod.ips_on_network(network) {
                match ip {
                    IpAddr::V4(v4) => ips.v4.push(v4),
                    IpAddr::V6(v6) => ips.v6.push(v6),
                }
            }
        }
        ips.v4.sort_unstable();
        ips.v4.dedup();
        ips.v6.sort_unstable();
        ips.v6.dedup();
        ips
    }
}
