//! Crosstalk core: a duplex request/response channel over one-way,
//! unordered message-passing primitives.
//!
//! The transport is assumed to offer nothing beyond a fire-and-forget send
//! between two isolated execution contexts. This crate layers a reliable
//! point-to-point RPC channel on top: request/response correlation under
//! out-of-order delivery, a pairing handshake between previously
//! unacquainted endpoints, a single shared deadline timer, sliding-window
//! rate limiting, and three-layer inbound validation.
//!
//! The one-to-many registry that demultiplexes several channels through a
//! shared listener lives in the companion `crosstalk-hub` crate.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod engine;
pub mod envelope;
pub mod errors;
pub mod events;
pub mod rate_limiter;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod validation;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{ChannelConfig, RATE_LIMIT_WINDOW};
pub use engine::{
    ChannelEngine, EngineStats, HandlerOutcome, PublishOptions, SubscriptionHandler,
};
pub use envelope::{Envelope, ReturnCode, READY_MSG};
pub use errors::{ChannelError, Result};
pub use events::{ChannelEvent, EventEmitter, EventKind, ListenerId};
pub use rate_limiter::SlidingWindowRateLimiter;
pub use scheduler::TimeoutScheduler;
pub use transport::{InboundRaw, InboundSink, SendHints, TransportAdapter};
pub use types::{EndpointKey, SystemTimeSource, TimeSource, Timestamp};
pub use validation::{
    is_broadcast_message, is_ready_message, is_response_message, validate_message,
    validate_request, validate_response, ValidationError,
};
