//! Duplex channel engine
//!
//! One engine owns one logical conversation with exactly one remote peer on
//! top of a fire-and-forget transport. It turns that primitive into a
//! request/response channel: correlation of out-of-order responses by
//! request id, a pairing handshake that adopts the peer's identity key,
//! FIFO queueing of publishes issued before pairing completes, a shared
//! deadline timer for request timeouts, and terminal destroy semantics.
//!
//! Inbound raw events pass three trust layers before dispatch: the
//! transport's source check, structural validation, and pairing validation
//! against the adopted peer key.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use core::time::Duration;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelConfig, RATE_LIMIT_WINDOW};
use crate::envelope::{Envelope, ReturnCode, READY_MSG};
use crate::errors::{ChannelError, Result};
use crate::events::{ChannelEvent, EventEmitter};
use crate::rate_limiter::SlidingWindowRateLimiter;
use crate::scheduler::TimeoutScheduler;
use crate::transport::{InboundRaw, SendHints, TransportAdapter};
use crate::types::{EndpointKey, Timestamp};
use crate::validation::validate_message;

// ----------------------------------------------------------------------------
// Subscription Handlers
// ----------------------------------------------------------------------------

/// Outcome of invoking a subscription handler.
///
/// The reply contract is explicit: `NoReply` suppresses the response,
/// `Value` becomes a `Success` reply carrying the payload, and `Failure`
/// becomes a `ReceiverCallbackError` reply plus a local error event. A
/// handler failure never escapes the dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// Handle without replying; the remote caller keeps waiting
    NoReply,
    /// Reply with `ret = Success` and this payload in `data`
    Value(Value),
    /// Reply with `ret = ReceiverCallbackError` and this text in `msg`
    Failure(String),
}

/// Handler registered for an inbound command
pub type SubscriptionHandler =
    Arc<dyn Fn(Envelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

struct Subscription {
    handler: SubscriptionHandler,
    once: bool,
}

// ----------------------------------------------------------------------------
// Correlation Bookkeeping
// ----------------------------------------------------------------------------

struct PendingCorrelation {
    cmdname: String,
    tx: oneshot::Sender<Result<Envelope>>,
}

struct QueuedTask {
    request_id: String,
    envelope: Envelope,
    timeout: Duration,
    hints: Option<SendHints>,
}

/// Per-call options for [`ChannelEngine::publish`]
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deadline override; the channel default applies when absent
    pub timeout: Option<Duration>,
    /// Opaque side-channel hints forwarded to the transport
    pub hints: Option<SendHints>,
}

/// Counters exposed by [`ChannelEngine::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub timeouts: u64,
    pub dropped: u64,
}

// ----------------------------------------------------------------------------
// Engine State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct EngineState {
    started: bool,
    destroyed: bool,
    is_ready: bool,
    peer_key: Option<EndpointKey>,
    next_seq: u64,
    pending: HashMap<String, PendingCorrelation>,
    queued: VecDeque<QueuedTask>,
    subscriptions: HashMap<String, Subscription>,
    ready_waiters: Vec<oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

struct EngineShared {
    self_key: EndpointKey,
    config: ChannelConfig,
    transport: Arc<dyn TransportAdapter>,
    scheduler: TimeoutScheduler,
    limiter: Mutex<SlidingWindowRateLimiter>,
    events: EventEmitter,
    state: Mutex<EngineState>,
    stats: Mutex<EngineStats>,
}

/// Outcome of the layer-3 pairing gate for one inbound envelope
enum Gate {
    Drop(&'static str),
    NewlyPaired { flushed: Vec<QueuedTask> },
    Pass,
}

// ----------------------------------------------------------------------------
// Channel Engine
// ----------------------------------------------------------------------------

/// Duplex request/response channel over a fire-and-forget transport.
///
/// Cheap to clone; clones share the same underlying channel.
#[derive(Clone)]
pub struct ChannelEngine {
    inner: Arc<EngineShared>,
}

impl ChannelEngine {
    /// Create an engine. No traffic flows until [`ChannelEngine::start`].
    pub fn new(transport: Arc<dyn TransportAdapter>, config: ChannelConfig) -> Self {
        let limiter = SlidingWindowRateLimiter::new(
            config.rate_limit_per_second as usize,
            RATE_LIMIT_WINDOW,
        );
        Self {
            inner: Arc::new(EngineShared {
                self_key: EndpointKey::generate(),
                config,
                transport,
                scheduler: TimeoutScheduler::new(),
                limiter: Mutex::new(limiter),
                events: EventEmitter::new(),
                state: Mutex::new(EngineState::default()),
                stats: Mutex::new(EngineStats::default()),
            }),
        }
    }

    /// Create an engine and immediately start it
    pub async fn connect(transport: Arc<dyn TransportAdapter>, config: ChannelConfig) -> Result<Self> {
        let engine = Self::new(transport, config);
        engine.start().await?;
        Ok(engine)
    }

    /// Wire the transport listener and send the pairing handshake.
    ///
    /// Idempotent: a second call on a started engine is a no-op.
    pub async fn start(&self) -> Result<()> {
        let shared = &self.inner;
        {
            let mut state = self.lock_state();
            if state.destroyed {
                return Err(ChannelError::ConnectionDestroyed);
            }
            if state.started {
                return Ok(());
            }
            state.started = true;
        }

        let (sink, mut rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                engine.dispatch_inbound(event).await;
            }
        });
        self.lock_state().pump = Some(pump);

        shared.transport.setup_listener(sink).await?;

        // Handshake: a correlated request shape so the peer can acknowledge,
        // but deliberately not tracked as a pending correlation. The ready
        // transition is driven by the inbound handshake (request or ack),
        // so an unanswered handshake produces no timeout noise.
        let request_id = {
            let mut state = self.lock_state();
            state.next_seq += 1;
            shared.self_key.request_id(state.next_seq)
        };
        let handshake =
            Envelope::handshake(request_id).stamped(&shared.self_key, Timestamp::now());
        match shared.transport.send_raw(&handshake, None).await {
            Ok(()) => {
                self.lock_stats().messages_sent += 1;
                shared.events.emit(&ChannelEvent::MessageSent {
                    envelope: handshake,
                });
            }
            Err(e) => {
                // The peer may still initiate pairing from its side
                warn!(error = %e, "handshake send failed");
                shared.events.emit(&ChannelEvent::Error {
                    message: format!("handshake send failed: {e}"),
                });
            }
        }
        info!(self_key = %shared.self_key, "channel started, awaiting peer");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publish / Broadcast
    // ------------------------------------------------------------------

    /// Issue a correlated request and wait for its settlement.
    ///
    /// The returned envelope reports the outcome in-band through `ret`:
    /// a deadline expiry resolves (never fails) with `ReturnCode::TimeOut`.
    /// Before pairing completes the request is queued and transmitted, in
    /// publish order, once the handshake lands.
    pub async fn publish(
        &self,
        cmdname: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<Envelope> {
        let shared = &self.inner;
        let PublishOptions { timeout, hints } = options;
        let timeout = timeout.unwrap_or(shared.config.request_timeout);

        let (rx, transmit) = {
            let mut state = self.lock_state();
            if state.destroyed {
                return Err(ChannelError::ConnectionDestroyed);
            }
            state.next_seq += 1;
            let request_id = shared.self_key.request_id(state.next_seq);
            let envelope = Envelope::request(request_id.as_str(), cmdname, data)
                .stamped(&shared.self_key, Timestamp::now());
            check_size(&envelope, shared.config.max_message_size)?;

            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                request_id.clone(),
                PendingCorrelation {
                    cmdname: cmdname.to_string(),
                    tx,
                },
            );
            if state.is_ready {
                (rx, Some((request_id, envelope, hints)))
            } else {
                state.queued.push_back(QueuedTask {
                    request_id,
                    envelope,
                    timeout,
                    hints,
                });
                (rx, None)
            }
        };

        if let Some((request_id, envelope, hints)) = transmit {
            self.transmit_request(&request_id, timeout, envelope, hints)
                .await;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::ConnectionDestroyed),
        }
    }

    /// Issue a request and map its in-band outcome to the typed error
    /// taxonomy, returning the reply payload on success.
    pub async fn call(&self, cmdname: &str, data: Value) -> Result<Value> {
        let timeout = self.inner.config.request_timeout;
        let response = self
            .publish(cmdname, data, PublishOptions::default())
            .await?;
        match response.ret {
            Some(ReturnCode::Success) | None => Ok(response.data.unwrap_or(Value::Null)),
            Some(ReturnCode::TimeOut) => Err(ChannelError::MethodCallTimeout {
                cmdname: cmdname.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
            Some(ReturnCode::NoSubscribe) => Err(ChannelError::MethodNotFound {
                cmdname: cmdname.to_string(),
            }),
            Some(ReturnCode::ReceiverCallbackError) => Err(ChannelError::HandlerError {
                reason: response.msg.unwrap_or_else(|| "handler failed".to_string()),
            }),
            Some(ReturnCode::SendCallbackError) => Err(ChannelError::TransmissionFailed {
                reason: response
                    .msg
                    .unwrap_or_else(|| "remote send failed".to_string()),
            }),
        }
    }

    /// Send a one-way broadcast envelope. No correlation, no queueing: a
    /// rate-limited broadcast is dropped with a warning, a transport
    /// failure is returned to the caller.
    pub async fn broadcast(&self, cmdname: &str, data: Value) -> Result<()> {
        let shared = &self.inner;
        if self.lock_state().destroyed {
            return Err(ChannelError::ConnectionDestroyed);
        }
        let envelope =
            Envelope::broadcast(cmdname, data).stamped(&shared.self_key, Timestamp::now());
        check_size(&envelope, shared.config.max_message_size)?;

        if !self.lock_limiter().try_acquire() {
            warn!(cmdname, "broadcast dropped by rate limiter");
            self.lock_stats().dropped += 1;
            shared.events.emit(&ChannelEvent::RateLimited {
                cmdname: cmdname.to_string(),
            });
            return Ok(());
        }

        match shared.transport.send_raw(&envelope, None).await {
            Ok(()) => {
                self.lock_stats().messages_sent += 1;
                shared
                    .events
                    .emit(&ChannelEvent::MessageSent { envelope });
                Ok(())
            }
            Err(e) => {
                shared.events.emit(&ChannelEvent::Error {
                    message: format!("broadcast send failed: {e}"),
                });
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a handler for an inbound command. Re-registering an
    /// already-subscribed command overwrites it with a warning.
    pub fn subscribe<F>(&self, cmdname: &str, handler: F) -> &Self
    where
        F: Fn(Envelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
    {
        self.subscribe_handler(cmdname, Arc::new(handler), false);
        self
    }

    /// Register a handler invoked at most once. The subscription is removed
    /// before the handler outcome is observed, so a second matching request
    /// is answered with `NoSubscribe` even if the first handler failed.
    pub fn subscribe_once<F>(&self, cmdname: &str, handler: F) -> &Self
    where
        F: Fn(Envelope) -> BoxFuture<'static, HandlerOutcome> + Send + Sync + 'static,
    {
        self.subscribe_handler(cmdname, Arc::new(handler), true);
        self
    }

    /// Register a pre-built handler (used by hubs installing shared handlers)
    pub fn subscribe_handler(&self, cmdname: &str, handler: SubscriptionHandler, once: bool) {
        let replaced = {
            let mut state = self.lock_state();
            if state.destroyed {
                warn!(cmdname, "subscribe on destroyed channel ignored");
                return;
            }
            state
                .subscriptions
                .insert(cmdname.to_string(), Subscription { handler, once })
                .is_some()
        };
        if replaced {
            warn!(cmdname, "subscription overwritten");
            self.inner.events.emit(&ChannelEvent::Warning {
                message: format!("subscription for `{cmdname}` overwritten"),
            });
        }
    }

    /// Remove a subscription; no-op if absent
    pub fn unsubscribe(&self, cmdname: &str) -> &Self {
        self.lock_state().subscriptions.remove(cmdname);
        self
    }

    // ------------------------------------------------------------------
    // Inbound Dispatch
    // ------------------------------------------------------------------

    /// Single dispatch entry point fed by the transport adapter (or, for
    /// hub-managed channels, by the hub's shared router).
    pub async fn dispatch_inbound(&self, event: InboundRaw) {
        let shared = &self.inner;
        if self.lock_state().destroyed {
            return;
        }

        // Layer 1: adapter source check
        if !shared.transport.is_valid_source(&event) {
            debug!("inbound event rejected by source check");
            shared.events.emit(&ChannelEvent::Warning {
                message: ChannelError::OriginMismatch.to_string(),
            });
            return;
        }

        // Layer 2: structural validation
        if shared.config.strict_validation {
            if let Err(e) = validate_message(&event.payload) {
                debug!(error = %e, "inbound message failed validation");
                shared.events.emit(&ChannelEvent::Warning {
                    message: ChannelError::InvalidMessage(e).to_string(),
                });
                return;
            }
        }
        let envelope: Envelope = match serde_json::from_value(event.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "inbound message not envelope-shaped");
                shared.events.emit(&ChannelEvent::Warning {
                    message: format!("undecodable message: {e}"),
                });
                return;
            }
        };

        // Layer 3: pairing validation, adopting the peer on first handshake
        let gate = self.pairing_gate(&envelope);
        match gate {
            Gate::Drop(reason) => {
                debug!(reason, "inbound message rejected by pairing check");
                shared.events.emit(&ChannelEvent::Warning {
                    message: format!("message rejected: {reason}"),
                });
                return;
            }
            Gate::NewlyPaired { flushed } => {
                let peer = self
                    .peer_key()
                    .map(|k| k.as_str().to_string())
                    .unwrap_or_default();
                info!(peer_key = %peer, flushed = flushed.len(), "channel paired");
                shared.events.emit(&ChannelEvent::Ready { peer_key: peer });
                // Acknowledge a fresh handshake request before flushing:
                // the flushed requests must not outrun the ack, or a peer
                // that has not adopted us yet will reject them
                if !envelope.is_response() {
                    if let Some(request_id) = envelope.request_id.clone() {
                        let ack = Envelope::response(request_id, ReturnCode::Success, None)
                            .with_msg(READY_MSG);
                        self.send_reply(ack).await;
                    }
                }
                for task in flushed {
                    self.transmit_queued(task).await;
                }
            }
            Gate::Pass => {}
        }

        self.lock_stats().messages_received += 1;
        shared.events.emit(&ChannelEvent::MessageReceived {
            envelope: envelope.clone(),
        });

        // Response to one of our outstanding requests
        if let Some(request_id) = envelope.request_id.clone() {
            if envelope.is_response() {
                let pending = self.lock_state().pending.remove(&request_id);
                if let Some(pending) = pending {
                    shared.scheduler.remove(&request_id);
                    debug!(request_id = %request_id, cmdname = %pending.cmdname, "response correlated");
                    let _ = pending.tx.send(Ok(envelope));
                    return;
                }
            }
        }

        // Subscribed command
        if let Some(cmdname) = envelope.cmdname.clone() {
            let handler = {
                let mut state = self.lock_state();
                if state
                    .subscriptions
                    .get(&cmdname)
                    .is_some_and(|sub| sub.once)
                {
                    // Removed before the outcome is observed: exactly-once
                    state
                        .subscriptions
                        .remove(&cmdname)
                        .map(|sub| sub.handler)
                } else {
                    state
                        .subscriptions
                        .get(&cmdname)
                        .map(|sub| Arc::clone(&sub.handler))
                }
            };
            if let Some(handler) = handler {
                let request_id = envelope.request_id.clone();
                let outcome = handler(envelope).await;
                self.settle_handler_outcome(&cmdname, request_id, outcome)
                    .await;
                return;
            }
        }

        // Handshake with no other meaning: the first one was acknowledged
        // during the pairing transition above; repeats are no-ops
        if envelope.is_ready() {
            return;
        }

        // Unhandled request: tell the remote side now instead of making it
        // wait out its own deadline
        if !envelope.is_response() {
            if let Some(request_id) = envelope.request_id {
                let cmdname = envelope.cmdname.unwrap_or_default();
                debug!(request_id = %request_id, cmdname = %cmdname, "no subscriber, replying NoSubscribe");
                let reply = Envelope::response(request_id, ReturnCode::NoSubscribe, None)
                    .with_msg(format!("no subscriber for `{cmdname}`"));
                self.send_reply(reply).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Resolve once pairing completes, failing after `timeout`
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let rx = {
            let mut state = self.lock_state();
            if state.destroyed {
                return Err(ChannelError::ConnectionDestroyed);
            }
            if state.is_ready {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.ready_waiters.push(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ChannelError::ConnectionDestroyed),
            Err(_) => Err(ChannelError::ConnectionTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Tear the channel down. Idempotent; terminal from any state.
    ///
    /// Every pending correlation settles with `ConnectionDestroyed`, queued
    /// tasks and subscriptions are purged, the shared timer and rate limiter
    /// discard their state, and the transport listener is released. All
    /// bookkeeping is cleared before the first await point.
    pub async fn destroy(&self) {
        let shared = &self.inner;
        let first = {
            let mut state = self.lock_state();
            if state.destroyed {
                false
            } else {
                state.destroyed = true;
                true
            }
        };
        if !first {
            return;
        }

        shared.events.emit(&ChannelEvent::Destroy);

        let pump = {
            let mut state = self.lock_state();
            state.is_ready = false;
            state.peer_key = None;
            for (_, pending) in state.pending.drain() {
                let _ = pending.tx.send(Err(ChannelError::ConnectionDestroyed));
            }
            state.queued.clear();
            state.subscriptions.clear();
            // Dropping the senders wakes ready-waiters with a closed error
            state.ready_waiters.clear();
            state.pump.take()
        };
        shared.scheduler.destroy();
        self.lock_limiter().reset();
        shared.events.clear();
        if let Some(pump) = pump {
            pump.abort();
        }

        if let Err(e) = shared.transport.teardown_listener().await {
            warn!(error = %e, "listener teardown failed");
        }
        info!(self_key = %shared.self_key, "channel destroyed");
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Identity token this endpoint advertises
    pub fn self_key(&self) -> &EndpointKey {
        &self.inner.self_key
    }

    /// Identity token adopted from the remote peer, if paired
    pub fn peer_key(&self) -> Option<EndpointKey> {
        self.lock_state().peer_key.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().is_ready
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock_state().destroyed
    }

    /// Outstanding correlated requests (queued ones included)
    pub fn pending_count(&self) -> usize {
        self.lock_state().pending.len()
    }

    /// Publishes waiting for pairing to complete
    pub fn queued_count(&self) -> usize {
        self.lock_state().queued.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_state().subscriptions.len()
    }

    pub fn stats(&self) -> EngineStats {
        *self.lock_stats()
    }

    /// Lifecycle event registry for observability hooks
    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.inner.state.lock().expect("engine state poisoned")
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, EngineStats> {
        self.inner.stats.lock().expect("engine stats poisoned")
    }

    fn lock_limiter(&self) -> std::sync::MutexGuard<'_, SlidingWindowRateLimiter> {
        self.inner.limiter.lock().expect("rate limiter poisoned")
    }

    /// Layer-3 gate. First valid handshake adopts the sender as the peer
    /// (first-writer-wins, never overwritten); afterwards the sender key
    /// must match, and response shapes must correlate to ids we issued.
    fn pairing_gate(&self, envelope: &Envelope) -> Gate {
        let shared = &self.inner;
        let mut state = self.lock_state();
        let sender = envelope.sender_key.as_deref().filter(|s| !s.is_empty());

        if let Some(peer) = &state.peer_key {
            if sender.is_some_and(|s| s != peer.as_str()) {
                return Gate::Drop("sender key does not match paired peer");
            }
            if envelope.is_response()
                && envelope
                    .request_id
                    .as_deref()
                    .is_some_and(|id| !shared.self_key.owns_request(id))
            {
                return Gate::Drop("response to a request this channel never issued");
            }
            return Gate::Pass;
        }

        if !envelope.is_ready() {
            return Gate::Drop("message received before pairing");
        }
        let Some(sender) = sender else {
            return Gate::Drop("handshake without sender key");
        };
        if envelope.is_response()
            && envelope
                .request_id
                .as_deref()
                .is_some_and(|id| !shared.self_key.owns_request(id))
        {
            return Gate::Drop("handshake ack for a foreign request id");
        }

        state.peer_key = Some(EndpointKey::from_string(sender));
        state.is_ready = true;
        let flushed = state.queued.drain(..).collect();
        for waiter in state.ready_waiters.drain(..) {
            let _ = waiter.send(());
        }
        Gate::NewlyPaired { flushed }
    }

    /// Arm the deadline, pass the rate limiter, and hand off to the
    /// transport. Rate-limited and failed sends leave the deadline armed so
    /// the caller settles through the timeout path.
    async fn transmit_request(
        &self,
        request_id: &str,
        timeout: Duration,
        envelope: Envelope,
        hints: Option<SendHints>,
    ) {
        let shared = &self.inner;

        let weak = Arc::downgrade(&self.inner);
        let timeout_id = request_id.to_string();
        shared.scheduler.add(request_id, timeout, move || {
            if let Some(shared) = weak.upgrade() {
                fire_timeout(&shared, &timeout_id, timeout);
            }
        });

        if !self.lock_limiter().try_acquire() {
            let cmdname = envelope.cmdname.unwrap_or_default();
            warn!(request_id, cmdname = %cmdname, "send dropped by rate limiter");
            self.lock_stats().dropped += 1;
            shared.events.emit(&ChannelEvent::RateLimited { cmdname });
            return;
        }

        match shared.transport.send_raw(&envelope, hints.as_ref()).await {
            Ok(()) => {
                self.lock_stats().messages_sent += 1;
                shared
                    .events
                    .emit(&ChannelEvent::MessageSent { envelope });
            }
            Err(e) => {
                // The request is not failed here; it settles via its deadline
                error!(request_id, error = %e, "transport send failed");
                shared.events.emit(&ChannelEvent::Error {
                    message: format!("send failed: {e}"),
                });
            }
        }
    }

    async fn transmit_queued(&self, task: QueuedTask) {
        self.transmit_request(&task.request_id, task.timeout, task.envelope, task.hints)
            .await;
    }

    /// Turn a handler outcome into the reply (or its absence) the remote
    /// caller observes
    async fn settle_handler_outcome(
        &self,
        cmdname: &str,
        request_id: Option<String>,
        outcome: HandlerOutcome,
    ) {
        let Some(request_id) = request_id else {
            // One-way message: nothing to reply to, but a failure is still
            // worth a local event
            if let HandlerOutcome::Failure(reason) = outcome {
                error!(cmdname, reason = %reason, "handler failed for one-way message");
                self.inner.events.emit(&ChannelEvent::Error {
                    message: format!("handler for `{cmdname}` failed: {reason}"),
                });
            }
            return;
        };

        match outcome {
            HandlerOutcome::NoReply => {}
            HandlerOutcome::Value(value) => {
                let reply = Envelope::response(request_id, ReturnCode::Success, Some(value));
                self.send_reply(reply).await;
            }
            HandlerOutcome::Failure(reason) => {
                error!(cmdname, reason = %reason, "handler failed");
                self.inner.events.emit(&ChannelEvent::Error {
                    message: format!("handler for `{cmdname}` failed: {reason}"),
                });
                let reply =
                    Envelope::response(request_id, ReturnCode::ReceiverCallbackError, None)
                        .with_msg(reason);
                self.send_reply(reply).await;
            }
        }
    }

    /// Stamp and send a response envelope. Replies bypass the rate limiter:
    /// dropping one would push the remote caller into an unattributable
    /// timeout.
    async fn send_reply(&self, envelope: Envelope) {
        let shared = &self.inner;
        let envelope = envelope.stamped(&shared.self_key, Timestamp::now());
        if let Err(e) = check_size(&envelope, shared.config.max_message_size) {
            warn!(error = %e, "reply exceeds size ceiling, dropped");
            shared.events.emit(&ChannelEvent::Warning {
                message: e.to_string(),
            });
            return;
        }
        match shared.transport.send_raw(&envelope, None).await {
            Ok(()) => {
                self.lock_stats().messages_sent += 1;
                shared
                    .events
                    .emit(&ChannelEvent::MessageSent { envelope });
            }
            Err(e) => {
                error!(error = %e, "reply send failed");
                shared.events.emit(&ChannelEvent::Error {
                    message: format!("reply send failed: {e}"),
                });
            }
        }
    }
}

/// Deadline callback: settle the correlation with a synthetic timeout
/// response. Resolution, not failure: timeouts travel in-band via `ret`.
fn fire_timeout(shared: &Arc<EngineShared>, request_id: &str, timeout: Duration) {
    let pending = shared
        .state
        .lock()
        .expect("engine state poisoned")
        .pending
        .remove(request_id);
    let Some(pending) = pending else {
        return;
    };
    warn!(request_id = %request_id, cmdname = %pending.cmdname, "request timed out");
    let synthetic = Envelope::response(request_id, ReturnCode::TimeOut, None)
        .with_msg(format!("no response within {}ms", timeout.as_millis()));
    let _ = pending.tx.send(Ok(synthetic));
    shared.stats.lock().expect("engine stats poisoned").timeouts += 1;
    shared.events.emit(&ChannelEvent::Timeout {
        request_id: request_id.to_string(),
        cmdname: pending.cmdname,
    });
}

fn check_size(envelope: &Envelope, limit: usize) -> Result<()> {
    if limit == 0 {
        return Ok(());
    }
    let size = envelope.serialized_size()?;
    if size > limit {
        return Err(ChannelError::MessageSizeExceeded { size, limit });
    }
    Ok(())
}
