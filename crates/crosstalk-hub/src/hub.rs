//! Multi-endpoint hub: registry, shared router, fan-out, cleanup
//!
//! One hub owns a channel engine per remote endpoint and demultiplexes a
//! single physical listener across all of them: the host attributes each
//! raw inbound event to a sender id and hands it to [`MessageHub::route_raw`].
//! On top of the registry the hub offers registration bookkeeping, global
//! handlers installed on every channel, broadcast to all (or by declared
//! type), a periodic liveness sweep, and the restart notification that lets
//! remote peers survive the hub's own memory being wiped.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use core::time::Duration;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crosstalk_core::{
    ChannelConfig, ChannelEngine, ChannelError, Envelope, HandlerOutcome, InboundRaw, Result,
    SubscriptionHandler, Timestamp,
};

use crate::host::{EndpointId, EndpointTransport, HubHost};
use crate::meta::{ClientMeta, RegisterPayload, HOST_RESTART_EVENT, REGISTER_COMMAND};

// ----------------------------------------------------------------------------
// Callbacks & Configuration
// ----------------------------------------------------------------------------

/// Invoked when a remote endpoint completes registration
pub type ConnectCallback = Arc<dyn Fn(&ClientMeta) + Send + Sync>;

/// Invoked when a registered endpoint is removed (explicitly or by sweep)
pub type DisconnectCallback = Arc<dyn Fn(&EndpointId) + Send + Sync>;

/// Decides whether a raw event from an unregistered sender should lazily
/// create a channel for it (the host-restart recovery path)
pub type AdoptCallback = Arc<dyn Fn(&EndpointId) -> bool + Send + Sync>;

/// Hub configuration
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval of the periodic liveness sweep
    pub cleanup_interval: Duration,
    /// Configuration applied to every managed channel
    pub channel: ChannelConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(30), // 30s sweep
            channel: ChannelConfig::default(),
        }
    }
}

// ----------------------------------------------------------------------------
// Hub State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct HubState {
    engines: HashMap<EndpointId, ChannelEngine>,
    meta: HashMap<EndpointId, ClientMeta>,
    global_handlers: HashMap<String, SubscriptionHandler>,
    cleanup: Option<JoinHandle<()>>,
    shutdown: bool,
}

struct HubShared {
    host: Arc<dyn HubHost>,
    config: HubConfig,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    adopt_unknown: Option<AdoptCallback>,
    state: Mutex<HubState>,
}

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Builder for [`MessageHub`]
pub struct HubBuilder {
    host: Arc<dyn HubHost>,
    config: HubConfig,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
    adopt_unknown: Option<AdoptCallback>,
}

impl HubBuilder {
    pub fn new(host: Arc<dyn HubHost>) -> Self {
        Self {
            host,
            config: HubConfig::default(),
            on_connect: None,
            on_disconnect: None,
            adopt_unknown: None,
        }
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.config.channel = config;
        self
    }

    pub fn on_connect(mut self, callback: impl Fn(&ClientMeta) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(
        mut self,
        callback: impl Fn(&EndpointId) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnect = Some(Arc::new(callback));
        self
    }

    /// Adopt every unknown sender (lazily creating its channel)
    pub fn adopt_unknown_endpoints(self) -> Self {
        self.adopt_unknown_with(|_| true)
    }

    pub fn adopt_unknown_with(
        mut self,
        callback: impl Fn(&EndpointId) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.adopt_unknown = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> MessageHub {
        MessageHub {
            inner: Arc::new(HubShared {
                host: self.host,
                config: self.config,
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                adopt_unknown: self.adopt_unknown,
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// Build and start the periodic cleanup sweep
    pub fn build_and_start(self) -> MessageHub {
        let hub = self.build();
        hub.start();
        hub
    }
}

// ----------------------------------------------------------------------------
// Message Hub
// ----------------------------------------------------------------------------

/// Registry and router for many channels sharing one physical listener.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct MessageHub {
    inner: Arc<HubShared>,
}

impl MessageHub {
    pub fn builder(host: Arc<dyn HubHost>) -> HubBuilder {
        HubBuilder::new(host)
    }

    /// Spawn the periodic liveness sweep. Idempotent.
    pub fn start(&self) {
        let mut state = self.lock_state();
        if state.shutdown || state.cleanup.is_some() {
            return;
        }
        let interval = self.inner.config.cleanup_interval;
        let weak = Arc::downgrade(&self.inner);
        state.cleanup = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let hub = MessageHub { inner: shared };
                let removed = hub.sweep_stale().await;
                if !removed.is_empty() {
                    debug!(removed = removed.len(), "cleanup sweep removed endpoints");
                }
            }
        }));
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    /// Create (or return the existing) channel for an endpoint. The new
    /// channel gets the hub's registration handler and every global handler
    /// installed before it can observe traffic.
    pub async fn add_endpoint(&self, endpoint: EndpointId) -> Result<ChannelEngine> {
        if let Some(existing) = self.engine(&endpoint) {
            return Ok(existing);
        }
        let transport = Arc::new(EndpointTransport::new(
            Arc::clone(&self.inner.host),
            endpoint.clone(),
        ));
        let engine = ChannelEngine::new(transport, self.inner.config.channel.clone());
        self.attach(&endpoint, &engine);
        engine.start().await?;

        let raced = {
            let mut state = self.lock_state();
            if state.shutdown {
                None
            } else {
                match state.engines.entry(endpoint.clone()) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        Some(entry.get().clone())
                    }
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(engine.clone());
                        info!(endpoint = %endpoint, "endpoint added");
                        return Ok(engine);
                    }
                }
            }
        };
        // Shutdown raced in, or another caller added the endpoint first
        engine.destroy().await;
        match raced {
            Some(existing) => Ok(existing),
            None => Err(ChannelError::ConnectionDestroyed),
        }
    }

    /// Destroy and remove one endpoint; `true` if it was registered
    pub async fn remove_endpoint(&self, endpoint: &EndpointId) -> bool {
        let engine = {
            let mut state = self.lock_state();
            state.meta.remove(endpoint);
            state.engines.remove(endpoint)
        };
        let Some(engine) = engine else {
            return false;
        };
        engine.destroy().await;
        info!(endpoint = %endpoint, "endpoint removed");
        if let Some(callback) = &self.inner.on_disconnect {
            callback(endpoint);
        }
        true
    }

    /// The channel registered for an endpoint, if any
    pub fn engine(&self, endpoint: &EndpointId) -> Option<ChannelEngine> {
        self.lock_state().engines.get(endpoint).cloned()
    }

    /// Registration metadata for an endpoint, if it has registered
    pub fn client_meta(&self, endpoint: &EndpointId) -> Option<ClientMeta> {
        self.lock_state().meta.get(endpoint).cloned()
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock_state().engines.len()
    }

    pub fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.lock_state().engines.keys().cloned().collect()
    }

    pub fn client_metas(&self) -> Vec<ClientMeta> {
        self.lock_state().meta.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Shared Routing
    // ------------------------------------------------------------------

    /// Route one attributed raw event to its endpoint's channel.
    ///
    /// Unknown senders are dropped unless the adopt callback accepts them,
    /// in which case a channel is created on the spot. This is how a
    /// restarted hub re-acquires endpoints that still believe they are
    /// connected.
    pub async fn route_raw(&self, endpoint: &EndpointId, payload: Value) {
        let engine = match self.engine(endpoint) {
            Some(engine) => Some(engine),
            None => {
                let adopt = self
                    .inner
                    .adopt_unknown
                    .as_ref()
                    .is_some_and(|accept| accept(endpoint));
                if adopt {
                    info!(endpoint = %endpoint, "adopting unknown endpoint");
                    match self.add_endpoint(endpoint.clone()).await {
                        Ok(engine) => Some(engine),
                        Err(e) => {
                            warn!(endpoint = %endpoint, error = %e, "adoption failed");
                            None
                        }
                    }
                } else {
                    debug!(endpoint = %endpoint, "event from unknown endpoint dropped");
                    None
                }
            }
        };
        if let Some(engine) = engine {
            engine
                .dispatch_inbound(InboundRaw::with_origin(payload, endpoint.as_str()))
                .await;
        }
    }

    // ------------------------------------------------------------------
    // Global Subscriptions
    // ------------------------------------------------------------------

    /// Register a handler once, across every current and future channel.
    /// The per-channel wrapper augments the inbound payload with
    /// `endpointId` and `clientMeta` before invoking it.
    pub fn on<F>(&self, cmdname: &str, handler: F) -> &Self
    where
        F: Fn(Envelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
    {
        let handler: SubscriptionHandler = Arc::new(handler);
        let engines: Vec<(EndpointId, ChannelEngine)> = {
            let mut state = self.lock_state();
            state
                .global_handlers
                .insert(cmdname.to_string(), Arc::clone(&handler));
            state
                .engines
                .iter()
                .map(|(id, engine)| (id.clone(), engine.clone()))
                .collect()
        };
        for (endpoint, engine) in engines {
            engine.subscribe_handler(
                cmdname,
                self.wrap_global(endpoint, Arc::clone(&handler)),
                false,
            );
        }
        self
    }

    /// Remove a global handler from the table and from every channel
    pub fn off(&self, cmdname: &str) -> &Self {
        let engines: Vec<ChannelEngine> = {
            let mut state = self.lock_state();
            state.global_handlers.remove(cmdname);
            state.engines.values().cloned().collect()
        };
        for engine in engines {
            engine.unsubscribe(cmdname);
        }
        self
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Fan an event out to every live, registered endpoint, optionally
    /// excluding one. Returns the number of attempted sends; per-endpoint
    /// failures are logged and never abort the loop.
    pub async fn broadcast_to_all(
        &self,
        cmdname: &str,
        data: Value,
        exclude: Option<&EndpointId>,
    ) -> usize {
        self.broadcast_filtered(cmdname, data, exclude, None).await
    }

    /// Fan an event out to live endpoints whose declared type matches
    pub async fn broadcast_to_type(&self, app_type: &str, cmdname: &str, data: Value) -> usize {
        self.broadcast_filtered(cmdname, data, None, Some(app_type))
            .await
    }

    async fn broadcast_filtered(
        &self,
        cmdname: &str,
        data: Value,
        exclude: Option<&EndpointId>,
        app_type: Option<&str>,
    ) -> usize {
        // The host's live directory is authoritative; the hub's own
        // registry may hold entries whose endpoint has already gone away
        let live = self.inner.host.enumerate_live_endpoints().await;
        let mut attempted = 0;
        for endpoint in live {
            if exclude.is_some_and(|excluded| *excluded == endpoint) {
                continue;
            }
            let (engine, meta) = {
                let state = self.lock_state();
                (
                    state.engines.get(&endpoint).cloned(),
                    state.meta.get(&endpoint).cloned(),
                )
            };
            let Some(engine) = engine else {
                continue;
            };
            if let Some(wanted) = app_type {
                if meta.as_ref().map(|m| m.app_type.as_str()) != Some(wanted) {
                    continue;
                }
            }
            attempted += 1;
            if let Err(e) = engine.broadcast(cmdname, data.clone()).await {
                warn!(endpoint = %endpoint, error = %e, "broadcast send failed");
            }
        }
        debug!(cmdname, attempted, "broadcast fan-out complete");
        attempted
    }

    /// Push the restart notification to every live endpoint so remote
    /// peers re-run their registration handshake. Returns the number of
    /// endpoints reached.
    pub async fn notify_restart(&self) -> usize {
        let live = self.inner.host.enumerate_live_endpoints().await;
        let mut envelope = Envelope::broadcast(HOST_RESTART_EVENT, json!({}));
        envelope.time = Some(Timestamp::now().as_millis());
        let payload = match envelope.to_value() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "restart notification not serializable");
                return 0;
            }
        };

        let mut reached = 0;
        for endpoint in &live {
            match self
                .inner
                .host
                .send_to_endpoint(endpoint, payload.clone())
                .await
            {
                Ok(()) => reached += 1,
                Err(e) => warn!(endpoint = %endpoint, error = %e, "restart notification failed"),
            }
        }
        info!(reached, total = live.len(), "restart notification pushed");
        reached
    }

    // ------------------------------------------------------------------
    // Liveness Cleanup
    // ------------------------------------------------------------------

    /// Diff the registry against the host's live directory; destroy and
    /// remove every registered endpoint that is no longer alive. Returns
    /// the removed ids. The periodic sweep calls this on its interval.
    pub async fn sweep_stale(&self) -> Vec<EndpointId> {
        let live: HashSet<EndpointId> = self
            .inner
            .host
            .enumerate_live_endpoints()
            .await
            .into_iter()
            .collect();

        let stale: Vec<(EndpointId, ChannelEngine)> = {
            let mut state = self.lock_state();
            let gone: Vec<EndpointId> = state
                .engines
                .keys()
                .filter(|id| !live.contains(*id))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|id| {
                    state.meta.remove(&id);
                    state.engines.remove(&id).map(|engine| (id, engine))
                })
                .collect()
        };

        let mut removed = Vec::with_capacity(stale.len());
        for (endpoint, engine) in stale {
            info!(endpoint = %endpoint, "endpoint no longer live, removing");
            engine.destroy().await;
            if let Some(callback) = &self.inner.on_disconnect {
                callback(&endpoint);
            }
            removed.push(endpoint);
        }
        removed
    }

    /// Stop the sweep and destroy every managed channel. Idempotent.
    pub async fn shutdown(&self) {
        let (cleanup, engines) = {
            let mut state = self.lock_state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.meta.clear();
            state.global_handlers.clear();
            (
                state.cleanup.take(),
                state.engines.drain().collect::<Vec<_>>(),
            )
        };
        if let Some(handle) = cleanup {
            handle.abort();
        }
        for (endpoint, engine) in engines {
            engine.destroy().await;
            debug!(endpoint = %endpoint, "endpoint destroyed at shutdown");
        }
        info!("hub shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.inner.state.lock().expect("hub state poisoned")
    }

    /// Install the registration handler and every global handler on a
    /// freshly created channel
    fn attach(&self, endpoint: &EndpointId, engine: &ChannelEngine) {
        engine.subscribe_handler(
            REGISTER_COMMAND,
            self.register_handler(endpoint.clone()),
            false,
        );
        let handlers: Vec<(String, SubscriptionHandler)> = {
            let state = self.lock_state();
            state
                .global_handlers
                .iter()
                .map(|(cmdname, handler)| (cmdname.clone(), Arc::clone(handler)))
                .collect()
        };
        for (cmdname, handler) in handlers {
            engine.subscribe_handler(&cmdname, self.wrap_global(endpoint.clone(), handler), false);
        }
    }

    /// Handler for the reserved registration command: store the declared
    /// metadata, fire the connect callback, ack with the endpoint count
    fn register_handler(&self, endpoint: EndpointId) -> SubscriptionHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |envelope: Envelope| {
            let weak = weak.clone();
            let endpoint = endpoint.clone();
            let future: BoxFuture<'static, HandlerOutcome> = Box::pin(async move {
                let Some(shared) = weak.upgrade() else {
                    return HandlerOutcome::NoReply;
                };
                let payload: RegisterPayload = envelope
                    .data
                    .and_then(|data| serde_json::from_value(data).ok())
                    .unwrap_or_default();
                let meta = ClientMeta::from_registration(endpoint.clone(), payload);
                let count = {
                    let mut state = shared.state.lock().expect("hub state poisoned");
                    state.meta.insert(endpoint.clone(), meta.clone());
                    state.engines.len()
                };
                info!(endpoint = %endpoint, app_type = %meta.app_type, "endpoint registered");
                if let Some(callback) = &shared.on_connect {
                    callback(&meta);
                }
                HandlerOutcome::Value(json!({ "count": count }))
            });
            future
        })
    }

    /// Wrap a global handler for one endpoint: augment the payload with the
    /// endpoint id and its registration metadata before invoking it
    fn wrap_global(&self, endpoint: EndpointId, handler: SubscriptionHandler) -> SubscriptionHandler {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |mut envelope: Envelope| {
            let meta = weak.upgrade().and_then(|shared| {
                let state = shared.state.lock().expect("hub state poisoned");
                state.meta.get(&endpoint).cloned()
            });
            let mut data = match envelope.data.take() {
                Some(Value::Object(map)) => map,
                _ => serde_json::Map::new(),
            };
            data.insert("endpointId".to_string(), json!(endpoint.as_str()));
            data.insert(
                "clientMeta".to_string(),
                meta.and_then(|m| serde_json::to_value(m).ok())
                    .unwrap_or(Value::Null),
            );
            envelope.data = Some(Value::Object(data));
            handler(envelope)
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
