//! Error types for the crosstalk channel protocol
//!
//! `ChannelError` is the taxonomy surfaced to application code. Structural
//! problems with inbound messages are reported through the finer-grained
//! `ValidationError` and wrapped into `ChannelError::InvalidMessage` where
//! they cross the public API.

use crate::validation::ValidationError;

/// Errors surfaced to application code by channels and hubs
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    /// The channel was destroyed; every pending and future operation fails
    #[error("channel has been destroyed")]
    ConnectionDestroyed,

    /// Pairing did not complete within the allowed window
    #[error("connection not established within {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// A correlated request elapsed its deadline (typed-call surface only;
    /// raw `publish` reports timeouts in-band via `ReturnCode::TimeOut`)
    #[error("call to `{cmdname}` timed out after {timeout_ms}ms")]
    MethodCallTimeout { cmdname: String, timeout_ms: u64 },

    /// The remote endpoint has no subscriber for the command
    #[error("remote endpoint has no subscriber for `{cmdname}`")]
    MethodNotFound { cmdname: String },

    /// The transport failed to hand the message off
    #[error("transport send failed: {reason}")]
    TransmissionFailed { reason: String },

    /// Outbound payload exceeds the configured size ceiling
    #[error("message size {size} bytes exceeds limit of {limit} bytes")]
    MessageSizeExceeded { size: usize, limit: usize },

    /// Outbound send refused by the sliding-window rate limiter
    #[error("rate limit of {limit} sends per {window_ms}ms exceeded")]
    RateLimitExceeded { limit: u32, window_ms: u64 },

    /// The remote subscription handler reported a failure
    #[error("remote handler failed: {reason}")]
    HandlerError { reason: String },

    /// Inbound message failed structural validation
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),

    /// Inbound event rejected by the transport's source check
    #[error("message source rejected by transport adapter")]
    OriginMismatch,
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, ChannelError>;
