//! Policy compiler
//!
//! Turns a (policy, target pod, interface) triple plus a cluster snapshot
//! into the text of a packet-filter table. Pure functions over snapshots; the
//! reconciler's only job is to produce snapshots and call the orchestrator.

pub mod common;
pub mod generator;
pub mod ports;
pub mod selector;

pub use generator::{render_table, GeneratedTable};
pub use ports::{resolve_port, PortRange, ResolvedPort};
pub use selector::{FamilyIps, SelectorEval};
