//! Namespace applier
//!
//! Enters a pod's network namespace on a pinned OS thread and installs,
//! replaces, or removes this agent's rule tables atomically. Only tables
//! under the reserved name prefix are ever touched.

pub mod applier;
pub mod netns;
pub mod nft;

pub use applier::{host_path, NftApplier, PacketFilter};
pub use netns::{within, NetnsGuard};
