//! Error types for the multi-network policy agent

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Annotation error: {0}")]
    Annotation(String),

    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Netns error: {0}")]
    Netns(String),

    #[error("Packet filter error: {0}")]
    PacketFilter(String),

    #[error("Runtime resolver error: {0}")]
    Runtime(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller should retry the whole apply later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Netns(_) | Error::Runtime(_) | Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
