//! Transport adapter contract
//!
//! The engine never touches a physical delivery mechanism. An adapter owns
//! the real listener (frame messaging, worker messaging, a test loopback),
//! performs the layer-1 source check, and hands already-demultiplexed raw
//! events into the engine's dispatch entry point through the sink it was
//! given at listener setup.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::errors::Result;

// ----------------------------------------------------------------------------
// Raw Inbound Events
// ----------------------------------------------------------------------------

/// A raw event as delivered by the physical listener.
///
/// `origin` is an opaque adapter-interpreted source tag (an origin string, a
/// window identity, an endpoint id); the engine only forwards it back to the
/// adapter's [`TransportAdapter::is_valid_source`] check.
#[derive(Debug, Clone)]
pub struct InboundRaw {
    pub payload: Value,
    pub origin: Option<String>,
}

impl InboundRaw {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            origin: None,
        }
    }

    pub fn with_origin(payload: Value, origin: impl Into<String>) -> Self {
        Self {
            payload,
            origin: Some(origin.into()),
        }
    }
}

/// Sink through which an adapter delivers raw events to the engine
pub type InboundSink = mpsc::UnboundedSender<InboundRaw>;

// ----------------------------------------------------------------------------
// Send Hints
// ----------------------------------------------------------------------------

/// Opaque side-channel hints forwarded to the adapter with an outbound send
/// (e.g. transferable resources a platform transport can move rather than
/// copy). The engine never inspects them.
#[derive(Debug, Clone, Default)]
pub struct SendHints {
    pub side_channel: Option<Value>,
}

// ----------------------------------------------------------------------------
// Transport Adapter
// ----------------------------------------------------------------------------

/// Contract between a channel engine and the component that physically
/// delivers bytes.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Begin delivering raw inbound events into `sink`
    async fn setup_listener(&self, sink: InboundSink) -> Result<()>;

    /// Stop delivering inbound events and release listener resources
    async fn teardown_listener(&self) -> Result<()>;

    /// Hand one envelope to the physical send primitive.
    ///
    /// May fail with [`crate::ChannelError::TransmissionFailed`]; the engine
    /// logs such failures and lets the originating request time out rather
    /// than failing it.
    async fn send_raw(&self, envelope: &Envelope, hints: Option<&SendHints>) -> Result<()>;

    /// Layer-1 filter: whether the raw event comes from an acceptable
    /// source. Evaluated before structural validation.
    fn is_valid_source(&self, event: &InboundRaw) -> bool;
}
