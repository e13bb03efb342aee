//! Operator configuration

use clap::Parser;
use std::path::{Path, PathBuf};

use mnp_core::types::CommonRules;
use mnp_core::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "mnp-agent")]
#[command(about = "Per-node agent enforcing multi-network policies with nftables", long_about = None)]
pub struct Cli {
    /// Accept ICMP traffic in every generated table
    #[arg(long)]
    pub accept_icmp: bool,

    /// Accept ICMPv6 traffic in every generated table
    #[arg(long)]
    pub accept_icmpv6: bool,

    /// File with raw IPv4 rules appended to every ingress chain
    #[arg(long)]
    pub custom_v4_ingress_rule_file: Option<PathBuf>,

    /// File with raw IPv4 rules appended to every egress chain
    #[arg(long)]
    pub custom_v4_egress_rule_file: Option<PathBuf>,

    /// File with raw IPv6 rules appended to every ingress chain
    #[arg(long)]
    pub custom_v6_ingress_rule_file: Option<PathBuf>,

    /// File with raw IPv6 rules appended to every egress chain
    #[arg(long)]
    pub custom_v6_egress_rule_file: Option<PathBuf>,

    /// Comma-separated CNI plugin types policies apply to
    #[arg(long, default_value = "macvlan")]
    pub network_plugins: String,

    /// CRI endpoint used to resolve pod network namespaces
    #[arg(long)]
    pub container_runtime_endpoint: String,

    /// Prefix netns paths with this host mount point
    #[arg(long)]
    pub host_prefix: Option<PathBuf>,

    /// Node name to filter target pods by (defaults to the hostname)
    #[arg(long)]
    pub hostname_override: Option<String>,
}

/// Validated agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub common_rules: CommonRules,
    pub allowed_plugins: Vec<String>,
    pub runtime_endpoint: String,
    pub host_prefix: Option<PathBuf>,
    pub node_name: String,
}

impl AgentConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        if cli.container_runtime_endpoint.trim().is_empty() {
            return Err(Error::Config(
                "container-runtime-endpoint must not be empty".to_string(),
            ));
        }

        let allowed_plugins: Vec<String> = cli
            .network_plugins
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        if allowed_plugins.is_empty() {
            return Err(Error::Config(
                "network-plugins must list at least one CNI plugin type".to_string(),
            ));
        }

        let common_rules = CommonRules {
            accept_icmp: cli.accept_icmp,
            accept_icmpv6: cli.accept_icmpv6,
            ingress_v4: load_rule_lines(cli.custom_v4_ingress_rule_file.as_deref())?,
            ingress_v6: load_rule_lines(cli.custom_v6_ingress_rule_file.as_deref())?,
            egress_v4: load_rule_lines(cli.custom_v4_egress_rule_file.as_deref())?,
            egress_v6: load_rule_lines(cli.custom_v6_egress_rule_file.as_deref())?,
        };

        let node_name = match &cli.hostname_override {
            Some(name) => name.clone(),
            None => hostname::get()
                .map_err(|e| Error::Config(format!("Failed to read hostname: {}", e)))?
                .to_string_lossy()
                .to_string(),
        };

        Ok(Self {
            common_rules,
            allowed_plugins,
            runtime_endpoint: cli.container_runtime_endpoint.clone(),
            host_prefix: cli.host_prefix.clone(),
            node_name,
        })
    }
}

/// Read one raw-rule file, skipping blank lines and '#' comments.
fn load_rule_lines(path: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read rule file {}: {}", path.display(), e)))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
