//! Port resolution against the target pod

use mnp_core::types::{Pod, PortRef, PortSpec, Protocol};
use mnp_core::{Error, Result};

/// A port clause ready for rule emission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPort {
    pub protocol: Protocol,
    pub range: PortRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Single(u16),
    Range(u16, u16),
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortRange::Single(port) => write!(f, "{}", port),
            PortRange::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

/// Resolve one port specification against the target pod (not the peer).
///
/// Returns `Ok(None)` when a named port matches no container port; the clause
/// then matches no traffic and is dropped by the caller.
pub fn resolve_port(spec: &PortSpec, target: &Pod) -> Result<Option<ResolvedPort>> {
    match &spec.port {
        PortRef::Number(port) => {
            let range = match spec.end_port {
                Some(end) if end < *port => {
                    return Err(Error::Policy(format!(
                        "endPort {} is below port {}",
                        end, port
                    )));
                }
                Some(end) => PortRange::Range(*port, end),
                None => PortRange::Single(*port),
            };
            Ok(Some(ResolvedPort {
                protocol: spec.protocol,
                range,
            }))
        }
        PortRef::Name(name) => {
            if spec.end_port.is_some() {
                return Err(Error::Policy(format!(
                    "endPort requires a numeric port, got name {:?}",
                    name
                )));
            }
            let resolved = target
                .container_ports
                .iter()
                .find(|cp| cp.protocol == spec.protocol && cp.name.as_deref() == Some(name))
                .map(|cp| ResolvedPort {
                    protocol: spec.protocol,
                    range: PortRange::Single(cp.port),
                });
            Ok(resolved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnp_core::types::ContainerPort;
    use std::collections::BTreeMap;

    fn target(ports: Vec<ContainerPort>) -> Pod {
        Pod {
            namespace: "default".to_string(),
            name: "target".to_string(),
            uid: "uid-target".to_string(),
            node_name: "node1".to_string(),
            labels: BTreeMap::new(),
            host_network: false,
            running: true,
            interfaces: Vec::new(),
            container_ports: ports,
        }
    }

    fn spec(protocol: Protocol, port: PortRef, end_port: Option<u16>) -> PortSpec {
        PortSpec {
            protocol,
            port,
            end_port,
        }
    }

    #[test]
    fn test_numeric_port() {
        let resolved =
            resolve_port(&spec(Protocol::Tcp, PortRef::Number(80), None), &target(vec![]))
                .unwrap()
                .unwrap();
        assert_eq!(resolved.range, PortRange::Single(80));
    }

    #[test]
    fn test_port_range() {
        let resolved = resolve_port(
            &spec(Protocol::Udp, PortRef::Number(8000), Some(8010)),
            &target(vec![]),
        )
        .unwrap()
        .unwrap();
        assert_eq!(resolved.range, PortRange::Range(8000, 8010));
        assert_eq!(resolved.range.to_string(), "8000-8010");
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = resolve_port(
            &spec(Protocol::Tcp, PortRef::Number(8010), Some(8000)),
            &target(vec![]),
        )
        .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_named_port_resolution() {
        let pod = target(vec![ContainerPort {
            name: Some("https".to_string()),
            port: 8443,
            protocol: Protocol::Tcp,
        }]);
        let resolved = resolve_port(
            &spec(Protocol::Tcp, PortRef::Name("https".to_string()), None),
            &pod,
        )
        .unwrap()
        .unwrap();
        assert_eq!(resolved.range, PortRange::Single(8443));
    }

    #[test]
    fn test_named_port_protocol_mismatch() {
        let pod = target(vec![ContainerPort {
            name: Some("dns".to_string()),
            port: 53,
            protocol: Protocol::Udp,
        }]);
        let resolved = resolve_port(
            &spec(Protocol::Tcp, PortRef::Name("dns".to_string()), None),
            &pod,
        )
        .unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn test_unknown_named_port_matches_nothing() {
        let resolved = resolve_port(
            &spec(Protocol::Tcp, PortRef::Name("https".to_string()), None),
            &target(vec![]),
        )
        .unwrap();
        assert!(resolved.is_none());
    }
}
