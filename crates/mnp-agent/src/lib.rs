//! Per-node multi-network policy agent
//!
//! Watches policy, pod, namespace, and attachment objects and materializes
//! nftables rules inside each affected pod's network namespace.

pub mod config;
pub mod crd;
pub mod datastore;
pub mod orchestrator;
pub mod runtime;
pub mod watch;

pub use config::{AgentConfig, Cli};
pub use datastore::Datastore;
pub use orchestrator::Orchestrator;
pub use runtime::{CrictlResolver, RuntimeResolver};
