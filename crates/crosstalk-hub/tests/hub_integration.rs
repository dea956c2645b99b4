//! Hub behavior against a mock host: registration, global handlers,
//! broadcast fan-out, liveness cleanup, and restart recovery.
//!
//! The hub routes attributed raw events straight into each channel's
//! dispatch entry point, so every `route_raw(...).await` below has fully
//! settled by the time it returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crosstalk_core::{HandlerOutcome, Result};
use crosstalk_hub::{ClientMeta, EndpointId, HubHost, MessageHub, HOST_RESTART_EVENT};

// ----------------------------------------------------------------------------
// Mock Host
// ----------------------------------------------------------------------------

/// Host with a controllable live directory that records every raw send
struct MockHost {
    live: Mutex<Vec<EndpointId>>,
    sent: Mutex<Vec<(EndpointId, Value)>>,
}

impl MockHost {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            live: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn set_live(&self, ids: &[&str]) {
        *self.live.lock().unwrap() = ids.iter().map(|id| EndpointId::from(*id)).collect();
    }

    fn sends_to(&self, endpoint: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id.as_str() == endpoint)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn last_send_to(&self, endpoint: &str) -> Value {
        self.sends_to(endpoint)
            .pop()
            .unwrap_or_else(|| panic!("nothing sent to {endpoint}"))
    }
}

#[async_trait]
impl HubHost for MockHost {
    async fn enumerate_live_endpoints(&self) -> Vec<EndpointId> {
        self.live.lock().unwrap().clone()
    }

    async fn send_to_endpoint(&self, endpoint: &EndpointId, payload: Value) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((endpoint.clone(), payload));
        Ok(())
    }
}

/// Play a remote endpoint: complete the pairing handshake, then register
/// with the declared type and name
async fn pair_and_register(
    hub: &MessageHub,
    endpoint: &str,
    client_key: &str,
    app_type: &str,
    name: &str,
) {
    let id = EndpointId::from(endpoint);
    hub.add_endpoint(id.clone()).await.unwrap();
    hub.route_raw(
        &id,
        json!({
            "requestId": format!("{client_key}.1"),
            "msg": "ready",
            "senderKey": client_key,
        }),
    )
    .await;
    hub.route_raw(
        &id,
        json!({
            "requestId": format!("{client_key}.2"),
            "cmdname": "__register__",
            "senderKey": client_key,
            "data": {"type": app_type, "name": name},
        }),
    )
    .await;
}

// ----------------------------------------------------------------------------
// Registration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn registration_stores_meta_and_acks_with_count() {
    let host = MockHost::new();
    let connected: Arc<Mutex<Vec<ClientMeta>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&connected);
    let hub = MessageHub::builder(host.clone())
        .on_connect(move |meta| sink.lock().unwrap().push(meta.clone()))
        .build();

    pair_and_register(&hub, "win-1", "ck", "panel", "Settings").await;

    let meta = hub
        .client_meta(&EndpointId::from("win-1"))
        .expect("registration not stored");
    assert_eq!(meta.app_type, "panel");
    assert_eq!(meta.name, "Settings");
    assert_eq!(connected.lock().unwrap().len(), 1);

    // The ack correlates to the register request and reports the count
    let ack = host.last_send_to("win-1");
    assert_eq!(ack["requestId"], "ck.2");
    assert_eq!(ack["ret"], 0);
    assert_eq!(ack["data"]["count"], 1);

    hub.shutdown().await;
}

#[tokio::test]
async fn channel_pairs_with_remote_before_registration() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();
    let id = EndpointId::from("win-1");
    let engine = hub.add_endpoint(id.clone()).await.unwrap();

    // Our side sent its handshake through the host at startup
    let sends = host.sends_to("win-1");
    assert_eq!(sends[0]["msg"], "ready");

    hub.route_raw(
        &id,
        json!({"requestId": "ck.1", "msg": "ready", "senderKey": "ck"}),
    )
    .await;

    assert!(engine.is_ready());
    assert_eq!(engine.peer_key().unwrap().as_str(), "ck");
    // And the remote handshake got its ack
    let ack = host.last_send_to("win-1");
    assert_eq!(ack["requestId"], "ck.1");
    assert_eq!(ack["ret"], 0);

    hub.shutdown().await;
}

// ----------------------------------------------------------------------------
// Global Handlers
// ----------------------------------------------------------------------------

#[tokio::test]
async fn global_handler_payload_is_augmented_with_endpoint_identity() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();

    let seen: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&seen);
    hub.on("refresh", move |envelope| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            *sink.lock().unwrap() = envelope.data.clone();
            HandlerOutcome::Value(json!({"refreshed": true}))
        })
    });

    // The endpoint is added *after* the global handler was registered
    pair_and_register(&hub, "win-1", "ck", "panel", "Settings").await;
    hub.route_raw(
        &EndpointId::from("win-1"),
        json!({
            "requestId": "ck.3",
            "cmdname": "refresh",
            "senderKey": "ck",
            "data": {"scope": "all"},
        }),
    )
    .await;

    let data = seen.lock().unwrap().clone().expect("handler not invoked");
    assert_eq!(data["scope"], "all");
    assert_eq!(data["endpointId"], "win-1");
    assert_eq!(data["clientMeta"]["appType"], "panel");
    assert_eq!(data["clientMeta"]["name"], "Settings");

    let reply = host.last_send_to("win-1");
    assert_eq!(reply["requestId"], "ck.3");
    assert_eq!(reply["data"]["refreshed"], true);

    hub.shutdown().await;
}

#[tokio::test]
async fn removed_global_handler_yields_no_subscribe() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();
    hub.on("transient", |_| {
        Box::pin(async { HandlerOutcome::Value(json!({})) })
    });
    pair_and_register(&hub, "win-1", "ck", "panel", "P").await;

    hub.off("transient");
    hub.route_raw(
        &EndpointId::from("win-1"),
        json!({
            "requestId": "ck.9",
            "cmdname": "transient",
            "senderKey": "ck",
        }),
    )
    .await;

    let reply = host.last_send_to("win-1");
    assert_eq!(reply["requestId"], "ck.9");
    assert_eq!(reply["ret"], -3);

    hub.shutdown().await;
}

// ----------------------------------------------------------------------------
// Broadcast
// ----------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_to_all_honors_exclusion_and_liveness() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();
    for id in ["a", "b", "c"] {
        hub.add_endpoint(EndpointId::from(id)).await.unwrap();
    }
    // "ghost" is live but never registered with the hub
    host.set_live(&["a", "b", "c", "ghost"]);

    let excluded = EndpointId::from("c");
    let count = hub
        .broadcast_to_all("tick", json!({"n": 1}), Some(&excluded))
        .await;
    assert_eq!(count, 2);

    for reached in ["a", "b"] {
        let payload = host.last_send_to(reached);
        assert_eq!(payload["cmdname"], "tick");
        assert_eq!(payload["broadcast"], true);
        assert_eq!(payload["data"]["n"], 1);
    }
    // The excluded endpoint only ever saw its startup handshake
    assert_eq!(host.sends_to("c").len(), 1);
    assert!(host.sends_to("ghost").is_empty());

    hub.shutdown().await;
}

#[tokio::test]
async fn broadcast_to_type_filters_on_declared_type() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();
    pair_and_register(&hub, "p1", "k1", "panel", "One").await;
    pair_and_register(&hub, "p2", "k2", "panel", "Two").await;
    pair_and_register(&hub, "w1", "k3", "widget", "Three").await;
    host.set_live(&["p1", "p2", "w1"]);

    let count = hub
        .broadcast_to_type("panel", "theme-changed", json!({"theme": "dark"}))
        .await;
    assert_eq!(count, 2);

    assert_eq!(host.last_send_to("p1")["cmdname"], "theme-changed");
    assert_eq!(host.last_send_to("p2")["cmdname"], "theme-changed");
    assert_ne!(host.last_send_to("w1")["cmdname"], "theme-changed");

    hub.shutdown().await;
}

// ----------------------------------------------------------------------------
// Liveness Cleanup
// ----------------------------------------------------------------------------

#[tokio::test]
async fn sweep_removes_endpoints_missing_from_live_directory() {
    let host = MockHost::new();
    let disconnected: Arc<Mutex<Vec<EndpointId>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&disconnected);
    let hub = MessageHub::builder(host.clone())
        .on_disconnect(move |id| sink.lock().unwrap().push(id.clone()))
        .build();

    let keep = hub.add_endpoint(EndpointId::from("alive")).await.unwrap();
    let stale = hub.add_endpoint(EndpointId::from("gone")).await.unwrap();
    host.set_live(&["alive"]);

    let removed = hub.sweep_stale().await;
    assert_eq!(removed, vec![EndpointId::from("gone")]);
    assert!(stale.is_destroyed());
    assert!(!keep.is_destroyed());
    assert_eq!(hub.endpoint_count(), 1);
    assert_eq!(*disconnected.lock().unwrap(), vec![EndpointId::from("gone")]);

    hub.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_sweep_runs_on_its_interval() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone())
        .cleanup_interval(Duration::from_millis(50))
        .build_and_start();

    hub.add_endpoint(EndpointId::from("gone")).await.unwrap();
    assert_eq!(hub.endpoint_count(), 1);

    // Host directory stays empty, so the sweep drops the endpoint
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hub.endpoint_count(), 0);

    hub.shutdown().await;
}

// ----------------------------------------------------------------------------
// Restart Recovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn restart_notification_reaches_every_live_endpoint() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();
    host.set_live(&["a", "b"]);

    let reached = hub.notify_restart().await;
    assert_eq!(reached, 2);

    for endpoint in ["a", "b"] {
        let payload = host.last_send_to(endpoint);
        assert_eq!(payload["cmdname"], HOST_RESTART_EVENT);
        assert_eq!(payload["broadcast"], true);
    }
}

#[tokio::test]
async fn unknown_sender_is_adopted_when_enabled() {
    let host = MockHost::new();
    let adopted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&adopted);
    let hub = MessageHub::builder(host.clone())
        .adopt_unknown_with(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .build();

    // A peer that survived our restart reconnects out of nowhere
    let id = EndpointId::from("survivor");
    hub.route_raw(
        &id,
        json!({"requestId": "sk.1", "msg": "ready", "senderKey": "sk"}),
    )
    .await;

    assert_eq!(adopted.load(Ordering::SeqCst), 1);
    assert_eq!(hub.endpoint_count(), 1);
    let engine = hub.engine(&id).expect("adopted engine missing");
    assert!(engine.is_ready());
    assert_eq!(engine.peer_key().unwrap().as_str(), "sk");

    hub.shutdown().await;
}

#[tokio::test]
async fn unknown_sender_is_dropped_by_default() {
    let host = MockHost::new();
    let hub = MessageHub::builder(host.clone()).build();

    hub.route_raw(
        &EndpointId::from("stranger"),
        json!({"requestId": "sk.1", "msg": "ready", "senderKey": "sk"}),
    )
    .await;

    assert_eq!(hub.endpoint_count(), 0);
    assert!(host.sends_to("stranger").is_empty());
}
