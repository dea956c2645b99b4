//! Host contract and the per-endpoint transport it backs
//!
//! The hub does not own a physical listener per endpoint. Its host supplies
//! two primitives: enumeration of the endpoints that are actually alive
//! right now, and a raw send addressed to one of them. Inbound traffic
//! arrives pre-attributed through [`crate::MessageHub::route_raw`], so the
//! per-endpoint transport adapter has no listener of its own.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crosstalk_core::{Envelope, InboundRaw, InboundSink, Result, SendHints, TransportAdapter};

// ----------------------------------------------------------------------------
// Endpoint Identity
// ----------------------------------------------------------------------------

/// Host-assigned identifier of one remote endpoint (a client id, a window
/// handle, a worker id), opaque to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// ----------------------------------------------------------------------------
// Hub Host
// ----------------------------------------------------------------------------

/// What the hub requires from its host platform
#[async_trait]
pub trait HubHost: Send + Sync {
    /// Ids of endpoints that are alive right now. Broadcasts and the
    /// cleanup sweep consult this directory, not the hub's registry, so
    /// stale registrations are never targeted.
    async fn enumerate_live_endpoints(&self) -> Vec<EndpointId>;

    /// Fire-and-forget raw send to one endpoint
    async fn send_to_endpoint(&self, endpoint: &EndpointId, payload: Value) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Endpoint Transport
// ----------------------------------------------------------------------------

/// Transport adapter for one hub-managed channel: outbound goes through the
/// host's addressed send; inbound arrives via the hub's shared router, so
/// listener setup is a no-op and the source check is already satisfied by
/// the host's attribution.
pub struct EndpointTransport {
    host: Arc<dyn HubHost>,
    endpoint: EndpointId,
}

impl EndpointTransport {
    pub fn new(host: Arc<dyn HubHost>, endpoint: EndpointId) -> Self {
        Self { host, endpoint }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }
}

#[async_trait]
impl TransportAdapter for EndpointTransport {
    async fn setup_listener(&self, _sink: InboundSink) -> Result<()> {
        Ok(())
    }

    async fn teardown_listener(&self) -> Result<()> {
        Ok(())
    }

    async fn send_raw(&self, envelope: &Envelope, _hints: Option<&SendHints>) -> Result<()> {
        let payload = envelope.to_value()?;
        self.host.send_to_endpoint(&self.endpoint, payload).await
    }

    fn is_valid_source(&self, _event: &InboundRaw) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
