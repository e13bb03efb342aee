//! Core type definitions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::{Error, Result};

/// Traffic direction a policy constrains
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PolicyType {
    Ingress,
    Egress,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyType::Ingress => write!(f, "ingress"),
            PolicyType::Egress => write!(f, "egress"),
        }
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TCP" | "tcp" => Ok(Protocol::Tcp),
            "UDP" | "udp" => Ok(Protocol::Udp),
            "SCTP" | "sctp" => Ok(Protocol::Sctp),
            other => Err(Error::Policy(format!("Unsupported protocol: {}", other))),
        }
    }
}

/// Label selector operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single matchExpressions requirement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    pub values: Vec<String>,
}

/// Standard label selector. An empty selector matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
    pub match_expressions: Vec<SelectorRequirement>,
}

impl LabelSelector {
    /// Evaluate the selector against a label set.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        for req in &self.match_expressions {
            let value = labels.get(&req.key);
            let ok = match req.operator {
                SelectorOperator::In => {
                    value.map(|v| req.values.contains(v)).unwrap_or(false)
                }
                // NotIn and DoesNotExist also match objects without the key
                SelectorOperator::NotIn => {
                    value.map(|v| !req.values.contains(v)).unwrap_or(true)
                }
                SelectorOperator::Exists => value.is_some(),
                SelectorOperator::DoesNotExist => value.is_none(),
            };
            if !ok {
                return false;
            }
        }

        true
    }
}

/// A secondary network interface attached to a pod
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    /// Interface name inside the pod netns (e.g. "net1")
    pub name: String,
    /// Attachment network in "namespace/name" form
    pub network: String,
    pub ips: Vec<IpAddr>,
}

/// Container port declared by the target pod's spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub port: u16,
    pub protocol: Protocol,
}

/// A pod as seen by the policy compiler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub node_name: String,
    pub labels: BTreeMap<String, String>,
    pub host_network: bool,
    pub running: bool,
    pub interfaces: Vec<Interface>,
    pub container_ports: Vec<ContainerPort>,
}

impl Pod {
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.name.clone())
    }

    /// Eligible as policy target or peer: running, non-host-network, and
    /// carrying at least one parsed secondary attachment.
    pub fn is_eligible(&self) -> bool {
        self.running && !self.host_network && !self.interfaces.is_empty()
    }

    /// IPs the pod holds on the given network.
    pub fn ips_on_network(&self, network: &str) -> Vec<IpAddr> {
        self.interfaces
            .iter()
            .filter(|iface| iface.network == network)
            .flat_map(|iface| iface.ips.iter().copied())
            .collect()
    }
}

/// A namespace, used only by namespace selectors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// CIDR peer with exceptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: String,
    pub except: Vec<String>,
}

/// The other endpoint of a flow a rule constrains
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Peer {
    /// Pods matching `pods`, scoped by `namespaces` when present and by the
    /// policy's own namespace otherwise.
    PodSelector {
        pods: LabelSelector,
        namespaces: Option<LabelSelector>,
    },
    /// All eligible pods in the matched namespaces.
    NamespaceSelector { namespaces: LabelSelector },
    IpBlock(IpBlock),
}

/// Numeric or named port reference
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

/// Port clause of a rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub protocol: Protocol,
    pub port: PortRef,
    pub end_port: Option<u16>,
}

/// One ingress or egress rule: ordered peers and ordered ports.
/// Empty peers means any address; empty ports means any port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub peers: Vec<Peer>,
    pub ports: Vec<PortSpec>,
}

/// A multi-network policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub namespace: String,
    pub name: String,
    pub pod_selector: LabelSelector,
    /// Networks the policy applies to, in "namespace/name" form
    pub networks: Vec<String>,
    pub policy_types: Vec<PolicyType>,
    pub ingress: Vec<Rule>,
    pub egress: Vec<Rule>,
}

impl Policy {
    pub fn key(&self) -> (String, String) {
        (self.namespace.clone(), self.name.clone())
    }

    pub fn applies_to_direction(&self, direction: PolicyType) -> bool {
        self.policy_types.contains(&direction)
    }

    pub fn applies_to_network(&self, network: &str) -> bool {
        self.networks.iter().any(|n| n == network)
    }
}

/// Operator-supplied static rule content merged into every generated table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonRules {
    pub accept_icmp: bool,
    pub accept_icmpv6: bool,
    pub ingress_v4: Vec<String>,
    pub ingress_v6: Vec<String>,
    pub egress_v4: Vec<String>,
    pub egress_v6: Vec<String>,
}

/// Immutable view of the cluster objects one apply works against.
///
/// Three flat maps keyed by (namespace, name); `BTreeMap` iteration gives the
/// (namespace, name) ordering rule generation depends on.
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub pods: BTreeMap<(String, String), Pod>,
    pub namespaces: BTreeMap<String, Namespace>,
    pub policies: BTreeMap<(String, String), Policy>,
    /// Network "namespace/name" -> CNI plugin type, from the attachment
    /// definitions seen so far.
    pub network_plugins: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "web")])));
    }

    #[test]
    fn test_match_labels() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "web")]),
            match_expressions: Vec::new(),
        };
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "front")])));
        assert!(!selector.matches(&labels(&[("app", "db")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                SelectorRequirement {
                    key: "env".to_string(),
                    operator: SelectorOperator::In,
                    values: vec!["prod".to_string(), "staging".to_string()],
                },
                SelectorRequirement {
                    key: "canary".to_string(),
                    operator: SelectorOperator::DoesNotExist,
                    values: Vec::new(),
                },
            ],
        };
        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("canary", "yes")])));
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![SelectorRequirement {
                key: "role".to_string(),
                operator: SelectorOperator::NotIn,
                values: vec!["db".to_string()],
            }],
        };
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("role", "web")])));
        assert!(!selector.matches(&labels(&[("role", "db")])));
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("ICMP".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_pod_ips_on_network() {
        let pod = Pod {
            namespace: "default".to_string(),
            name: "pod-a".to_string(),
            uid: "uid-a".to_string(),
            node_name: "node1".to_string(),
            labels: BTreeMap::new(),
            host_network: false,
            running: true,
            interfaces: vec![
                Interface {
                    name: "net1".to_string(),
                    network: "default/red-net".to_string(),
                    ips: vec!["10.1.1.1".parse().unwrap()],
                },
                Interface {
                    name: "net2".to_string(),
                    network: "default/blue-net".to_string(),
                    ips: vec!["10.2.2.2".parse().unwrap()],
                },
            ],
            container_ports: Vec::new(),
        };
        assert_eq!(
            pod.ips_on_network("default/red-net"),
            vec!["10.1.1.1".parse::<IpAddr>().unwrap()]
        );
        assert!(pod.ips_on_network("default/green-net").is_empty());
    }
}
