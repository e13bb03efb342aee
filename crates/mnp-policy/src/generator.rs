//! nftables table generation
//!
//! Renders one `table inet` per (policy, interface) pairing. Output is a
//! byte-stable contract: equal snapshots must render identical text.

use ipnetwork::IpNetwork;
use tracing::warn;

use mnp_core::types::{
    ClusterSnapshot, CommonRules, Interface, IpBlock, Peer, Pod, Policy, PolicyType, PortRef,
    Rule,
};

use crate::common;
use crate::ports::{resolve_port, ResolvedPort};
use crate::selector::SelectorEval;

/// A rendered table and its identity
#[derive(Debug, Clone)]
pub struct GeneratedTable {
    pub name: String,
    pub text: String,
}

/// Render the table enforcing `policy` on one interface of `target`.
pub fn render_table(
    snapshot: &ClusterSnapshot,
    common_rules: &CommonRules,
    policy: &Policy,
    target: &Pod,
    iface: &Interface,
) -> GeneratedTable {
    let name = mnp_core::table_name(&policy.namespace, &policy.name, &iface.name);
    let eval = SelectorEval::new(snapshot, &policy.namespace);

    let mut out = String::with_capacity(1024);
    out.push_str(&format!("table inet {} {{\n", name));
    out.push_str("\tchain conntrack {\n");
    out.push_str("\t\tct state established,related accept\n");
    out.push_str("\t\tct state invalid drop\n");
    out.push_str("\t}\n");

    for direction in [PolicyType::Ingress, PolicyType::Egress] {
        if !policy.applies_to_direction(direction) {
            // The chain is omitted entirely; this direction is unaffected.
            continue;
        }
        out.push('\n');
        out.push_str(&format!("\tchain {} {{\n", direction));

        let (hook, dev_guard) = match direction {
            PolicyType::Ingress => ("input", format!("iifname != \"{}\" accept", iface.name)),
            PolicyType::Egress => ("output", format!("oifname != \"{}\" accept", iface.name)),
        };
        out.push_str(&format!(
            "\t\ttype filter hook {} priority 0; policy drop;\n",
            hook
        ));
        out.push_str(&format!("\t\t{}\n", dev_guard));
        out.push_str("\t\tjump conntrack\n");

        for line in common::preamble_lines(common_rules, direction) {
            out.push_str(&format!("\t\t{}\n", line));
        }

        let rules = match direction {
            PolicyType::Ingress => &policy.ingress,
            PolicyType::Egress => &policy.egress,
        };
        for rule in rules {
            for line in render_rule_lines(&eval, target, iface, rule, direction) {
                out.push_str(&format!("\t\t{}\n", line));
            }
        }

        for line in common::appendix_lines(common_rules, direction) {
            out.push_str(&format!("\t\t{}\n", line));
        }
        out.push_str("\t}\n");
    }

    out.push_str("}\n");
    GeneratedTable { name, text: out }
}

fn port_clause(port: &ResolvedPort) -> String {
    format!("{} dport {}", port.protocol, port.range)
}

/// Expand one policy rule into match lines, peers in policy order, IPv4
/// before IPv6 within each peer, ports in policy order within each family.
fn render_rule_lines(
    eval: &SelectorEval<'_>,
    target: &Pod,
    iface: &Interface,
    rule: &Rule,
    direction: PolicyType,
) -> Vec<String> {
    let addr_field = match direction {
        PolicyType::Ingress => "saddr",
        PolicyType::Egress => "daddr",
    };

    let mut resolved = Vec::new();
    for spec in &rule.ports {
        match resolve_port(spec, target) {
            Ok(Some(port)) => resolved.push(port),
            Ok(None) => {
                if let PortRef::Name(name) = &spec.port {
                    warn!(
                        "Named port {:?} does not resolve on pod {}/{}, dropping clause",
                        name, target.namespace, target.name
                    );
                }
            }
            Err(e) => {
                // Only the offending rule is dropped; the others still apply.
                warn!("Skipping {} rule: {}", direction, e);
                return Vec::new();
            }
        }
    }
    let want_ports = !rule.ports.is_empty();
    if want_ports && resolved.is_empty() {
        return Vec::new();
    }

    let mut lines = Vec::new();
    let mut emit = |match_expr: Option<String>| {
        if want_ports {
            for port in &resolved {
                match &match_expr {
                    Some(m) => lines.push(format!("{} {} accept", m, port_clause(port))),
                    None => lines.push(format!("{} accept", port_clause(port))),
                }
            }
        } else {
            match &match_expr {
                Some(m) => lines.push(format!("{} accept", m)),
                None => lines.push("accept".to_string()),
            }
        }
    };

    // Empty peer list means any source/destination.
    if rule.peers.is_empty() {
        emit(None);
        return lines;
    }

    for peer in &rule.peers {
        match peer {
            Peer::IpBlock(block) => {
                if let Some(expr) = ip_block_expr(block, addr_field) {
                    emit(Some(expr));
                }
            }
            selector_peer => {
                let ips = eval.peer_ips(selector_peer, &iface.network);
                if !ips.v4.is_empty() {
                    let members: Vec<String> = ips.v4.iter().map(|ip| ip.to_string()).collect();
                    emit(Some(format!(
                        "ip {} {{ {} }}",
                        addr_field,
                        members.join(", ")
                    )));
                }
                if !ips.v6.is_empty() {
                    let members: Vec<String> = ips.v6.iter().map(|ip| ip.to_string()).collect();
                    emit(Some(format!(
                        "ip6 {} {{ {} }}",
                        addr_field,
                        members.join(", ")
                    )));
                }
            }
        }
    }

    lines
}

/// Positive membership for the CIDR, negated membership per contained
/// exception. Exceptions outside the CIDR or of the other family are dropped.
fn ip_block_expr(block: &IpBlock, addr_field: &str) -> Option<String> {
    let net: IpNetwork = match block.cidr.parse() {
        Ok(net) => net,
        Err(e) => {
            warn!("Skipping IPBlock with invalid cidr {}: {}", block.cidr, e);
            return None;
        }
    };
    let family = if net.is_ipv4() { "ip" } else { "ip6" };

    let mut parts = vec![format!("{} {} {}", family, addr_field, net)];
    for raw in &block.except {
        let except: IpNetwork = match raw.parse() {
            Ok(except) => except,
            Err(e) => {
                warn!("Dropping invalid IPBlock exception {}: {}", raw, e);
                continue;
            }
        };
        let contained = except.is_ipv4() == net.is_ipv4()
            && net.prefix() <= except.prefix()
            && net.contains(except.network());
        if !contained {
            warn!("Dropping IPBlock exception {} not contained in {}", except, net);
            continue;
        }
        parts.push(format!("{} {} != {}", family, addr_field, except));
    }
    Some(parts.join(" "))
}
