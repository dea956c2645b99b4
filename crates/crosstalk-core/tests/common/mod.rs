//! Test transports: a collecting adapter that records outbound envelopes and
//! lets tests inject raw inbound events, and a loopback pair wiring two real
//! engines together in memory.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crosstalk_core::{
    ChannelError, Envelope, InboundRaw, InboundSink, Result, SendHints, TransportAdapter,
};

// ----------------------------------------------------------------------------
// Collecting Transport
// ----------------------------------------------------------------------------

/// Records everything the engine sends and exposes the inbound sink so tests
/// can play the remote peer by hand.
pub struct CollectingTransport {
    sent: Mutex<Vec<Envelope>>,
    sink: Mutex<Option<InboundSink>>,
    rejected_origin: Option<String>,
}

impl CollectingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            rejected_origin: None,
        })
    }

    /// A transport whose source check rejects events tagged with `origin`
    pub fn rejecting_origin(origin: &str) -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            rejected_origin: Some(origin.to_string()),
        })
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Deliver a raw payload as if the listener had produced it
    pub fn inject(&self, payload: Value) {
        self.inject_from(payload, "test-peer");
    }

    pub fn inject_from(&self, payload: Value, origin: &str) {
        let sink = self.sink.lock().unwrap();
        sink.as_ref()
            .expect("listener not set up")
            .send(InboundRaw::with_origin(payload, origin))
            .expect("inbound pump gone");
    }
}

#[async_trait]
impl TransportAdapter for CollectingTransport {
    async fn setup_listener(&self, sink: InboundSink) -> Result<()> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn teardown_listener(&self) -> Result<()> {
        self.sink.lock().unwrap().take();
        Ok(())
    }

    async fn send_raw(&self, envelope: &Envelope, _hints: Option<&SendHints>) -> Result<()> {
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(())
    }

    fn is_valid_source(&self, event: &InboundRaw) -> bool {
        match (&self.rejected_origin, &event.origin) {
            (Some(rejected), Some(origin)) => rejected != origin,
            _ => true,
        }
    }
}

// ----------------------------------------------------------------------------
// Loopback Pair
// ----------------------------------------------------------------------------

type SinkSlot = Arc<Mutex<Option<InboundSink>>>;

/// One side of an in-memory duplex link: sends land in the peer's sink.
pub struct LoopbackTransport {
    local: SinkSlot,
    remote: SinkSlot,
}

/// Build both sides of an in-memory link
pub fn loopback_pair() -> (Arc<LoopbackTransport>, Arc<LoopbackTransport>) {
    let left: SinkSlot = Arc::new(Mutex::new(None));
    let right: SinkSlot = Arc::new(Mutex::new(None));
    (
        Arc::new(LoopbackTransport {
            local: Arc::clone(&left),
            remote: Arc::clone(&right),
        }),
        Arc::new(LoopbackTransport {
            local: right,
            remote: left,
        }),
    )
}

#[async_trait]
impl TransportAdapter for LoopbackTransport {
    async fn setup_listener(&self, sink: InboundSink) -> Result<()> {
        *self.local.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn teardown_listener(&self) -> Result<()> {
        self.local.lock().unwrap().take();
        Ok(())
    }

    async fn send_raw(&self, envelope: &Envelope, _hints: Option<&SendHints>) -> Result<()> {
        let sink = self.remote.lock().unwrap().clone();
        match sink {
            Some(sink) => {
                let payload = envelope.to_value()?;
                // A receiver torn down mid-send is a lost message, not an
                // error: that is exactly what the real primitives do
                let _ = sink.send(InboundRaw::with_origin(payload, "loopback"));
                Ok(())
            }
            None => Err(ChannelError::TransmissionFailed {
                reason: "peer listener not attached".to_string(),
            }),
        }
    }

    fn is_valid_source(&self, _event: &InboundRaw) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Polling Helper
// ----------------------------------------------------------------------------

/// Await a condition that is satisfied by background pump tasks
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
