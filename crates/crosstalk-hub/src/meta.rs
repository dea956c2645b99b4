//! Registered-endpoint metadata and reserved wire commands

use serde::{Deserialize, Serialize};

use crosstalk_core::Timestamp;

use crate::host::EndpointId;

/// Reserved command a remote endpoint sends to register itself with the hub
pub const REGISTER_COMMAND: &str = "__register__";

/// Internal broadcast pushed to every live endpoint when the host restarts,
/// so remote peers re-run their registration handshake. The wire value is
/// kept byte-for-byte for compatibility with existing peers.
pub const HOST_RESTART_EVENT: &str = "__sw-activated__";

// ----------------------------------------------------------------------------
// Client Metadata
// ----------------------------------------------------------------------------

/// Declared metadata about one registered remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMeta {
    /// Host-assigned endpoint id
    pub endpoint_id: EndpointId,
    /// Self-declared application type (used by type-filtered broadcasts)
    pub app_type: String,
    /// Self-declared display name
    pub name: String,
    /// When the registration was accepted
    pub connected_at: Timestamp,
}

/// Payload a remote endpoint sends with [`REGISTER_COMMAND`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterPayload {
    #[serde(rename = "type", default)]
    pub app_type: String,
    #[serde(default)]
    pub name: String,
}

impl ClientMeta {
    /// Build metadata from a registration payload, stamped now
    pub fn from_registration(endpoint_id: EndpointId, payload: RegisterPayload) -> Self {
        Self {
            endpoint_id,
            app_type: payload.app_type,
            name: payload.name,
            connected_at: Timestamp::now(),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
