//! Crosstalk hub: one listener, many channels.
//!
//! A hub owns a `crosstalk-core` channel engine per remote endpoint and
//! routes a single stream of attributed raw events to the right one. It
//! layers registry semantics on top: a reserved registration command with
//! declared metadata, global handlers fanned out to every channel,
//! broadcast to all endpoints or by declared type, a periodic liveness
//! sweep against the host's endpoint directory, and a restart notification
//! that tells remote peers to re-register after the hub's memory was wiped.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod host;
pub mod hub;
pub mod meta;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use host::{EndpointId, EndpointTransport, HubHost};
pub use hub::{
    AdoptCallback, ConnectCallback, DisconnectCallback, HubBuilder, HubConfig, MessageHub,
};
pub use meta::{ClientMeta, RegisterPayload, HOST_RESTART_EVENT, REGISTER_COMMAND};
