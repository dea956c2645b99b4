//! Wire envelope for the crosstalk channel protocol
//!
//! Envelopes are plain JSON objects with camelCase field names, matching the
//! format remote peers already speak. Every field is optional on the wire;
//! which fields must be present for a given shape is enforced by the
//! validators in [`crate::validation`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ChannelError, Result};
use crate::types::{EndpointKey, Timestamp};

/// Marker carried in `msg` by pairing handshake envelopes
pub const READY_MSG: &str = "ready";

// ----------------------------------------------------------------------------
// Return Codes
// ----------------------------------------------------------------------------

/// Closed set of in-band request outcome codes.
///
/// Outcomes travel in the `ret` field of response envelopes instead of as
/// transport-level failures; in particular a deadline expiry is reported as
/// a successful response carrying [`ReturnCode::TimeOut`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ReturnCode {
    /// Request handled, reply payload in `data`
    Success,
    /// The remote subscription handler failed; details in `msg`
    ReceiverCallbackError,
    /// The remote side failed to transmit its reply
    SendCallbackError,
    /// No subscriber registered for the command on the remote side
    NoSubscribe,
    /// The request elapsed its deadline without a response
    TimeOut,
}

impl ReturnCode {
    /// Wire value of this code
    pub fn code(self) -> i32 {
        match self {
            ReturnCode::Success => 0,
            ReturnCode::ReceiverCallbackError => -1,
            ReturnCode::SendCallbackError => -2,
            ReturnCode::NoSubscribe => -3,
            ReturnCode::TimeOut => -99,
        }
    }

    /// Look up a code by wire value
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ReturnCode::Success),
            -1 => Some(ReturnCode::ReceiverCallbackError),
            -2 => Some(ReturnCode::SendCallbackError),
            -3 => Some(ReturnCode::NoSubscribe),
            -99 => Some(ReturnCode::TimeOut),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }
}

impl From<ReturnCode> for i32 {
    fn from(code: ReturnCode) -> i32 {
        code.code()
    }
}

impl TryFrom<i32> for ReturnCode {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        ReturnCode::from_code(value).ok_or_else(|| format!("unknown return code {value}"))
    }
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// The wire message exchanged between paired endpoints.
///
/// Constructed per send and never retained beyond dispatch. `time` and
/// `senderKey` are stamped by [`Envelope::stamped`] at the send site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Envelope {
    /// Correlation id; present on requests and echoed on responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// Command the message targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdname: Option<String>,

    /// Request or reply payload (plain JSON object)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Outcome code; its presence marks the envelope as a response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret: Option<ReturnCode>,

    /// Free-text detail (handshake marker, error text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Epoch-milliseconds stamped at send
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,

    /// Identity token of the sending endpoint, stamped at send
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_key: Option<String>,

    /// One-way fan-out marker; broadcast envelopes carry no correlation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub broadcast: bool,
}

impl Envelope {
    /// Build a correlated request envelope
    pub fn request(request_id: impl Into<String>, cmdname: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: Some(request_id.into()),
            cmdname: Some(cmdname.into()),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Build a response to the given request id
    pub fn response(request_id: impl Into<String>, ret: ReturnCode, data: Option<Value>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ret: Some(ret),
            data,
            ..Self::default()
        }
    }

    /// Build the pairing handshake request
    pub fn handshake(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            msg: Some(READY_MSG.to_string()),
            ..Self::default()
        }
    }

    /// Build a one-way broadcast envelope
    pub fn broadcast(cmdname: impl Into<String>, data: Value) -> Self {
        Self {
            cmdname: Some(cmdname.into()),
            data: Some(data),
            broadcast: true,
            ..Self::default()
        }
    }

    /// Attach free-text detail
    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// Stamp sender identity and send time
    pub fn stamped(mut self, sender: &EndpointKey, time: Timestamp) -> Self {
        self.sender_key = Some(sender.as_str().to_string());
        self.time = Some(time.as_millis());
        self
    }

    /// Whether this envelope is response-shaped (carries an outcome code)
    pub fn is_response(&self) -> bool {
        self.ret.is_some()
    }

    /// Whether this envelope is a pairing handshake (request or ack)
    pub fn is_ready(&self) -> bool {
        self.msg.as_deref() == Some(READY_MSG)
    }

    /// Serialized size in bytes, as counted against the size ceiling
    pub fn serialized_size(&self) -> Result<usize> {
        serde_json::to_vec(self)
            .map(|bytes| bytes.len())
            .map_err(|e| ChannelError::TransmissionFailed {
                reason: format!("envelope serialization failed: {e}"),
            })
    }

    /// Convert to the raw JSON form handed to transports
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ChannelError::TransmissionFailed {
            reason: format!("envelope serialization failed: {e}"),
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
