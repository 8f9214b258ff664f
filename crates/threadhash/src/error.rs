//! Error types for the threadhash core.
//!
//! Every fallible operation on the call surface returns [`BridgeError`].
//! Hashing failures and offload failures travel through the same channel as
//! success: a synchronous `Err` for inline calls, a failed completion for
//! offloaded ones.

/// Primary error type for the native core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Malformed hash parameters or call arguments.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An offload thread (or a delivery slot) could not be acquired.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// The background worker is already starting or running.
    #[error("worker already running")]
    AlreadyRunning,

    /// The background worker is not running.
    #[error("worker not running")]
    NotRunning,

    /// A host-supplied callback reported a failure.
    #[error("host callback failed: {0}")]
    HostCallback(String),

    /// The host context that owns the delivery queue has been dropped.
    #[error("host context is gone")]
    HostGone,

    /// Configuration could not be parsed or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Shorthand for [`BridgeError::InvalidInput`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Shorthand for [`BridgeError::ResourceUnavailable`].
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::ResourceUnavailable(msg.into())
    }

    /// Wrap a host callback failure, keeping the full context chain.
    pub fn from_host(err: &anyhow::Error) -> Self {
        Self::HostCallback(format!("{err:#}"))
    }

    /// Whether this error is a lifecycle no-op rather than a real failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::NotRunning)
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BridgeError>;
