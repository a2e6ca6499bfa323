use thiserror::Error;

/// Failure reported by a host transport. Transient errors keep the host
/// known and retried with backoff; fatal errors park the agent in
/// `Errored` until the filter or topology changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("host misconfigured: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Fatal errors are not retried; the agent moves to `Errored`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Auth(_) | TransportError::Config(_))
    }
}

/// Engine-side failure surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("invalid query range: from {from} is after to {to}")]
    InvalidRange { from: String, to: String },
    #[error("engine is shut down")]
    ShutDown,
}
