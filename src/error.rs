//! Crate-wide error taxonomy.
//!
//! Mirrors the error-handling design in §7: five outcomes an outbound
//! request's completion handle can resolve to, plus a `Lifecycle` variant
//! for synchronous start/stop misuse. `InvalidMessage` never reaches a
//! caller — it is logged and dropped at the router.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Malformed frames or a signature that failed to verify. Dropped
    /// silently by the router; never surfaced to application code.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The remote's `AppProtocolVersion` was rejected by the compatibility
    /// predicate.
    #[error("different protocol version")]
    DifferentVersion,

    /// The per-request deadline elapsed before the expected replies arrived.
    #[error("request timed out")]
    Timeout,

    /// The caller's own cancellation fired. Never logged as an error.
    #[error("request cancelled")]
    Cancelled,

    /// Retries exhausted (10) or an otherwise non-retryable failure.
    #[error("request failed: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("transport is already running")]
    AlreadyRunning,

    #[error("transport is not running")]
    NotRunning,

    #[error("transport has been disposed and is single-use")]
    Disposed,

    #[error("configuration requires either `host` or `ice_servers`")]
    MissingEndpointSource,
}
