//! Custom resource definitions and conversion into the core model

use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use mnp_core::annotations::parse_attachment_names;
use mnp_core::types::{
    IpBlock, LabelSelector, Peer, Policy, PolicyType, PortRef, PortSpec, Rule,
    SelectorOperator, SelectorRequirement,
};
use mnp_core::{Error, Result};

/// Networks a policy applies to, comma-separated
pub const POLICY_FOR_ANNOTATION: &str = "k8s.v1.cni.cncf.io/policy-for";

/// MultiNetworkPolicy Custom Resource
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1beta1",
    kind = "MultiNetworkPolicy",
    plural = "multi-networkpolicies",
    shortname = "multi-policy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MultiNetworkPolicySpec {
    pub pod_selector: metav1::LabelSelector,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_types: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<IngressRuleSpec>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<Vec<EgressRuleSpec>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<PeerSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EgressRuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<PeerSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<PortEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PeerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_selector: Option<metav1::LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<metav1::LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_block: Option<IpBlockSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IpBlockSpec {
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_port: Option<i32>,
}

/// NetworkAttachmentDefinition Custom Resource (spec.config carries the CNI
/// plugin configuration as raw JSON)
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    shortname = "net-attach-def",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
}

/// CNI plugin type declared by an attachment definition, handling both plain
/// and conflist configs.
pub fn plugin_type(nad: &NetworkAttachmentDefinition) -> Option<String> {
    let config = nad.spec.config.as_ref()?;
    let value: serde_json::Value = serde_json::from_str(config).ok()?;
    if let Some(t) = value.get("type").and_then(|v| v.as_str()) {
        return Some(t.to_string());
    }
    value
        .get("plugins")?
        .as_array()?
        .first()?
        .get("type")?
        .as_str()
        .map(String::from)
}

fn convert_selector(selector: &metav1::LabelSelector) -> Result<LabelSelector> {
    let match_labels = selector
        .match_labels
        .clone()
        .unwrap_or_default()
        .into_iter()
        .collect();

    let mut match_expressions = Vec::new();
    for req in selector.match_expressions.clone().unwrap_or_default() {
        let operator = match req.operator.as_str() {
            "In" => SelectorOperator::In,
            "NotIn" => SelectorOperator::NotIn,
            "Exists" => SelectorOperator::Exists,
            "DoesNotExist" => SelectorOperator::DoesNotExist,
            other => {
                return Err(Error::Policy(format!(
                    "Unsupported selector operator: {}",
                    other
                )));
            }
        };
        match_expressions.push(SelectorRequirement {
            key: req.key,
            operator,
            values: req.values.unwrap_or_default(),
        });
    }

    Ok(LabelSelector {
        match_labels,
        match_expressions,
    })
}

fn convert_port(entry: &PortEntry) -> Result<PortSpec> {
    let protocol = entry.protocol.as_deref().unwrap_or("TCP").parse()?;
    let port = match &entry.port {
        Some(IntOrString::Int(i)) => PortRef::Number(
            u16::try_from(*i).map_err(|_| Error::Policy(format!("Port {} out of range", i)))?,
        ),
        Some(IntOrString::String(s)) => PortRef::Name(s.clone()),
        None => return Err(Error::Policy("Port entry without a port".to_string())),
    };
    let end_port = entry
        .end_port
        .map(|e| {
            u16::try_from(e).map_err(|_| Error::Policy(format!("endPort {} out of range", e)))
        })
        .transpose()?;
    Ok(PortSpec {
        protocol,
        port,
        end_port,
    })
}

fn convert_peer(peer: &PeerSpec) -> Result<Peer> {
    if let Some(block) = &peer.ip_block {
        if peer.pod_selector.is_some() || peer.namespace_selector.is_some() {
            return Err(Error::Policy(
                "ipBlock peer must not carry selectors".to_string(),
            ));
        }
        return Ok(Peer::IpBlock(IpBlock {
            cidr: block.cidr.clone(),
            except: block.except.clone().unwrap_or_default(),
        }));
    }
    if let Some(pods) = &peer.pod_selector {
        return Ok(Peer::PodSelector {
            pods: convert_selector(pods)?,
            namespaces: peer
                .namespace_selector
                .as_ref()
                .map(convert_selector)
                .transpose()?,
        });
    }
    if let Some(namespaces) = &peer.namespace_selector {
        return Ok(Peer::NamespaceSelector {
            namespaces: convert_selector(namespaces)?,
        });
    }
    Err(Error::Policy(
        "Peer carries neither a selector nor an ipBlock".to_string(),
    ))
}

fn convert_rule(peers: Option<&Vec<PeerSpec>>, ports: Option<&Vec<PortEntry>>) -> Result<Rule> {
    let mut rule = Rule::default();
    for peer in peers.into_iter().flatten() {
        rule.peers.push(convert_peer(peer)?);
    }
    for port in ports.into_iter().flatten() {
        rule.ports.push(convert_port(port)?);
    }
    Ok(rule)
}

/// Convert the custom resource into the compiler's policy model.
///
/// A rule that fails conversion is logged and skipped; the remaining rules
/// still apply.
pub fn to_policy(obj: &MultiNetworkPolicy) -> Result<Policy> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let networks = obj
        .annotations()
        .get(POLICY_FOR_ANNOTATION)
        .map(|value| parse_attachment_names(&namespace, value))
        .unwrap_or_default();

    let policy_types = match &obj.spec.policy_types {
        Some(types) => {
            let mut converted = Vec::new();
            for t in types {
                match t.as_str() {
                    "Ingress" => converted.push(PolicyType::Ingress),
                    "Egress" => converted.push(PolicyType::Egress),
                    other => {
                        return Err(Error::Policy(format!("Unknown policy type: {}", other)))
                    }
                }
            }
            converted
        }
        // Absent policyTypes constrains ingress, and egress only when egress
        // rules are present.
        None => {
            let mut converted = vec![PolicyType::Ingress];
            if obj.spec.egress.is_some() {
                converted.push(PolicyType::Egress);
            }
            converted
        }
    };

    let mut ingress = Vec::new();
    for (idx, rule) in obj.spec.ingress.iter().flatten().enumerate() {
        match convert_rule(rule.from.as_ref(), rule.ports.as_ref()) {
            Ok(rule) => ingress.push(rule),
            Err(e) => warn!(
                "Skipping ingress rule {} of {}/{}: {}",
                idx, namespace, name, e
            ),
        }
    }
    let mut egress = Vec::new();
    for (idx, rule) in obj.spec.egress.iter().flatten().enumerate() {
        match convert_rule(rule.to.as_ref(), rule.ports.as_ref()) {
            Ok(rule) => egress.push(rule),
            Err(e) => warn!(
                "Skipping egress rule {} of {}/{}: {}",
                idx, namespace, name, e
            ),
        }
    }

    Ok(Policy {
        namespace,
        name,
        pod_selector: convert_selector(&obj.spec.pod_selector)?,
        networks,
        policy_types,
        ingress,
        egress,
    })
}
