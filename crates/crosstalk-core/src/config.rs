//! Channel configuration
//!
//! Knobs governing one channel's request deadlines, payload size ceiling,
//! outbound rate limiting, and inbound validation strictness.

use core::time::Duration;

/// Window over which the outbound rate limit is enforced
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Configuration for a single channel engine
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Default deadline for correlated requests
    pub request_timeout: Duration,
    /// Maximum serialized envelope size in bytes (0 disables the check)
    pub max_message_size: usize,
    /// Maximum outbound sends per second (0 disables enforcement)
    pub rate_limit_per_second: u32,
    /// Run structural validation on every inbound payload
    pub strict_validation: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5), // 5s per request
            max_message_size: 1024 * 1024,           // 1 MiB
            rate_limit_per_second: 100,              // 100 sends/s
            strict_validation: true,
        }
    }
}

impl ChannelConfig {
    /// Create a permissive configuration for testing
    pub fn permissive() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_message_size: 0,
            rate_limit_per_second: 0,
            strict_validation: true,
        }
    }

    /// Override the per-request deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the outbound rate limit
    pub fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit_per_second = per_second;
        self
    }

    /// Override the payload size ceiling
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }
}
