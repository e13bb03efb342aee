//! Parsing of the CNI multi-network pod annotations

use serde::Deserialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use tracing::warn;

use crate::types::Interface;
use crate::{Error, Result};

/// Comma-separated attachment identifiers requested by the pod
pub const NETWORKS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/networks";

/// JSON array describing the attachments the CNI actually wired up
pub const NETWORK_STATUS_ANNOTATION: &str = "k8s.v1.cni.cncf.io/network-status";

/// One entry of the network-status annotation
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkStatus {
    pub name: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Normalize an attachment identifier to "namespace/name".
///
/// Accepted forms: "net", "ns/net", and either with an "@ifname" suffix.
pub fn normalize_network_name(pod_namespace: &str, raw: &str) -> String {
    let name = raw.split('@').next().unwrap_or(raw).trim();
    if name.contains('/') {
        name.to_string()
    } else {
        format!("{}/{}", pod_namespace, name)
    }
}

/// Parse the networks annotation into normalized attachment names.
pub fn parse_attachment_names(pod_namespace: &str, networks: &str) -> Vec<String> {
    networks
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| normalize_network_name(pod_namespace, entry))
        .collect()
}

/// Join the two annotations into the pod's secondary interfaces.
///
/// Only status entries matching a requested attachment contribute; the entry
/// for the default pod network is never listed in the networks annotation and
/// falls out here. Interface names are unique within a pod; later duplicates
/// are ignored.
pub fn parse_interfaces(
    pod_namespace: &str,
    networks: &str,
    status_json: &str,
) -> Result<Vec<Interface>> {
    let requested: BTreeSet<String> =
        parse_attachment_names(pod_namespace, networks).into_iter().collect();

    let statuses: Vec<NetworkStatus> = serde_json::from_str(status_json)
        .map_err(|e| Error::Annotation(format!("Invalid network-status annotation: {}", e)))?;

    let mut seen = BTreeSet::new();
    let mut interfaces = Vec::new();
    for status in statuses {
        let network = normalize_network_name(pod_namespace, &status.name);
        if !requested.contains(&network) {
            continue;
        }
        let Some(ifname) = status.interface else {
            continue;
        };
        if !seen.insert(ifname.clone()) {
            warn!("Duplicate interface {} in network-status, ignoring", ifname);
            continue;
        }

        let mut ips: Vec<IpAddr> = Vec::new();
        for raw in &status.ips {
            match raw.parse() {
                Ok(ip) => ips.push(ip),
                Err(_) => warn!("Skipping invalid IP {} on attachment {}", raw, network),
            }
        }

        interfaces.push(Interface {
            name: ifname,
            network,
            ips,
        });
    }

    Ok(interfaces)
}
