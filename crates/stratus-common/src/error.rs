//! Common error types for Stratus components.

use thiserror::Error;

/// Common errors across Stratus components
#[derive(Debug, Error)]
pub enum StratusError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pool could not bind its listener
    #[error("Bind error: {0}")]
    Bind(String),

    /// No seed could be contacted
    #[error("Join error: {0}")]
    Join(String),

    /// Graceful leave did not complete
    #[error("Leave error: {0}")]
    Leave(String),

    /// A pool could not be shut down cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),

    /// Message encoding/decoding error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Packet sealing/opening error
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The cluster has been closed
    #[error("Cluster is closed")]
    Closed,

    /// Encoded message exceeds what a single gossip packet can carry
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl StratusError {
    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Bind(_) | Self::Join(_) | Self::Leave(_) | Self::Timeout(_)
        )
    }
}

/// Result alias used by the Stratus libraries
pub type Result<T> = std::result::Result<T, StratusError>;

impl From<bincode::Error> for StratusError {
    fn from(err: bincode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
