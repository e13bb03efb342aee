//! Operator-supplied common rules merged into every generated table

use mnp_core::types::{CommonRules, PolicyType};

/// Lines injected before the policy rules of a chain.
pub fn preamble_lines(common: &CommonRules, _direction: PolicyType) -> Vec<String> {
    let mut lines = Vec::new();
    if common.accept_icmp {
        lines.push("ip protocol icmp accept".to_string());
    }
    if common.accept_icmpv6 {
        lines.push("ip6 nexthdr icmpv6 accept".to_string());
    }
    lines
}

/// Raw per-family lines appended after the policy rules, IPv4 before IPv6.
pub fn appendix_lines(common: &CommonRules, direction: PolicyType) -> Vec<String> {
    let (v4, v6) = match direction {
        PolicyType::Ingress => (&common.ingress_v4, &common.ingress_v6),
        PolicyType::Egress => (&common.egress_v4, &common.egress_v6),
    };
    v4.iter().chain(v6.iter()).cloned().collect()
}
