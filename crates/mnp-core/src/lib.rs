//! Shared data model for the multi-network policy agent.
//!
//! Policies, pods, and namespaces are immutable snapshots for the duration of
//! one apply; the compiler and applier crates both build on these types.

pub mod annotations;
pub mod error;
pub mod types;

pub use error::{Error, Result};

/// Every table this agent owns starts with this prefix. Tables from foreign
/// sources in the same netns must not be touched.
pub const TABLE_PREFIX: &str = "mnp-";

/// Name of the table holding the rules for one (policy, interface) pairing.
pub fn table_name(policy_namespace: &str, policy_name: &str, interface: &str) -> String {
    format!("{}{}-{}-{}", TABLE_PREFIX, policy_namespace, policy_name, interface)
}

/// Prefix shared by all tables of one policy identity, across interfaces.
pub fn identity_prefix(policy_namespace: &str, policy_name: &str) -> String {
    format!("{}{}-{}-", TABLE_PREFIX, policy_namespace, policy_name)
}
