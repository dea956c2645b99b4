//! Core types for the crosstalk channel protocol
//!
//! Identity tokens, millisecond timestamps, and the `TimeSource` abstraction
//! that keeps time-dependent components testable without sleeping.

use core::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Endpoint Key
// ----------------------------------------------------------------------------

/// Identity token an endpoint advertises on the wire.
///
/// Generated once at channel construction from a cryptographically strong
/// random source and never changed for the lifetime of the channel. The
/// remote endpoint's key is adopted during the pairing handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Generate a fresh key (uuid v4, hex-compact form)
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing key string (e.g. one received on the wire)
    pub fn from_string(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Raw string form, as stamped into envelopes
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the request id for the given sequence number.
    ///
    /// Request ids are `key.counter`; the counter is monotonically increasing
    /// and never resets while the owning channel is alive.
    pub fn request_id(&self, seq: u64) -> String {
        format!("{}.{}", self.0, seq)
    }

    /// Whether a request id was issued by the endpoint holding this key
    pub fn owns_request(&self, request_id: &str) -> bool {
        request_id
            .strip_prefix(self.0.as_str())
            .is_some_and(|rest| rest.starts_with('.'))
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch, as stamped into envelopes at send time
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a timestamp from raw milliseconds
    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self(millis)
    }

    /// Raw millisecond value
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Duration elapsed since another timestamp (saturating)
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps.
///
/// Components that reason about elapsed time (the rate limiter in
/// particular) take a `TimeSource` so tests can drive time manually.
pub trait TimeSource {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of `TimeSource`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
