use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while setting up or using a process group.
#[derive(Error, Debug)]
pub enum DdpError {
    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, bad environment value, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection refused, peer vanished, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Rendezvous with the master rank failed
    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    /// A peer sent a frame that does not match the collective in progress
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A blocking step did not finish in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Rank outside of `0..world_size`
    #[error("rank {rank} is out of bounds for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// Buffer sizes disagree across ranks
    #[error("buffer length mismatch: expected {expected}, got {got}")]
    BufferLengthMismatch { expected: usize, got: usize },

    /// Collective called on a group that was already destroyed
    #[error("process group has already been destroyed")]
    ProcessGroupDestroyed,

    /// Transport backend could not be used
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for process-group operations.
pub type Result<T> = std::result::Result<T, DdpError>;

impl From<toml::ser::Error> for DdpError {
    fn from(e: toml::ser::Error) -> Self {
        DdpError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for DdpError {
    fn from(e: toml::de::Error) -> Self {
        DdpError::Serialization(e.to_string())
    }
}
