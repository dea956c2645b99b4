//! Structural validation of inbound wire messages
//!
//! Layer 2 of the inbound trust chain: after the transport's source check and
//! before pairing validation, every raw payload is checked for shape. These
//! are pure functions over `serde_json::Value` with no state; a rejected
//! message is dropped by the caller and never reaches application code.

use serde_json::Value;

use crate::envelope::{ReturnCode, READY_MSG};

// ----------------------------------------------------------------------------
// Validation Errors
// ----------------------------------------------------------------------------

/// Reasons a raw message fails structural validation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message carries none of `requestId`, `cmdname`, `msg`")]
    MissingIdentifyingField,

    #[error("field `{field}` must be {expected}")]
    WrongFieldType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("`ret` value {0} is not in the return-code set")]
    UnknownReturnCode(i64),

    #[error("field `{0}` must be a non-empty string")]
    EmptyField(&'static str),

    #[error("response message is missing `ret`")]
    MissingReturnCode,
}

// ----------------------------------------------------------------------------
// Message Validators
// ----------------------------------------------------------------------------

/// Validate the generic envelope shape.
///
/// A message must be a JSON object carrying at least one of `requestId`,
/// `cmdname`, or `msg`, and every optional field that is present must match
/// its declared type.
pub fn validate_message(raw: &Value) -> Result<(), ValidationError> {
    let obj = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    if !["requestId", "cmdname", "msg"]
        .iter()
        .any(|field| obj.contains_key(*field))
    {
        return Err(ValidationError::MissingIdentifyingField);
    }

    check_string(raw, "requestId")?;
    check_string(raw, "cmdname")?;
    check_string(raw, "msg")?;
    check_string(raw, "senderKey")?;

    if let Some(ret) = obj.get("ret") {
        let code = ret
            .as_i64()
            .ok_or(ValidationError::WrongFieldType {
                field: "ret",
                expected: "an integer return code",
            })?;
        let in_range = i32::try_from(code)
            .ok()
            .and_then(ReturnCode::from_code)
            .is_some();
        if !in_range {
            return Err(ValidationError::UnknownReturnCode(code));
        }
    }

    if let Some(data) = obj.get("data") {
        if !data.is_object() {
            return Err(ValidationError::WrongFieldType {
                field: "data",
                expected: "a plain object",
            });
        }
    }

    if let Some(time) = obj.get("time") {
        let finite = time.as_f64().is_some_and(f64::is_finite);
        if !finite {
            return Err(ValidationError::WrongFieldType {
                field: "time",
                expected: "a finite number",
            });
        }
    }

    if let Some(broadcast) = obj.get("broadcast") {
        if !broadcast.is_boolean() {
            return Err(ValidationError::WrongFieldType {
                field: "broadcast",
                expected: "a boolean",
            });
        }
    }

    Ok(())
}

/// Validate a request: the generic shape plus non-empty `requestId` and `cmdname`
pub fn validate_request(raw: &Value) -> Result<(), ValidationError> {
    validate_message(raw)?;
    require_non_empty(raw, "requestId")?;
    require_non_empty(raw, "cmdname")?;
    Ok(())
}

/// Validate a response: the generic shape plus a `ret` outcome code
pub fn validate_response(raw: &Value) -> Result<(), ValidationError> {
    validate_message(raw)?;
    if raw.get("ret").is_none() {
        return Err(ValidationError::MissingReturnCode);
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Message Classifiers
// ----------------------------------------------------------------------------

/// A response carries a numeric `ret` outcome code
pub fn is_response_message(raw: &Value) -> bool {
    raw.get("ret").is_some_and(Value::is_i64)
}

/// A pairing handshake carries `msg == "ready"`
pub fn is_ready_message(raw: &Value) -> bool {
    raw.get("msg").and_then(Value::as_str) == Some(READY_MSG)
}

/// A broadcast carries `broadcast == true` and a command name
pub fn is_broadcast_message(raw: &Value) -> bool {
    raw.get("broadcast").and_then(Value::as_bool) == Some(true)
        && raw.get("cmdname").is_some_and(Value::is_string)
}

// ----------------------------------------------------------------------------
// Field Helpers
// ----------------------------------------------------------------------------

fn check_string(raw: &Value, field: &'static str) -> Result<(), ValidationError> {
    match raw.get(field) {
        None => Ok(()),
        Some(value) if value.is_string() => Ok(()),
        Some(_) => Err(ValidationError::WrongFieldType {
            field,
            expected: "a string",
        }),
    }
}

fn require_non_empty(raw: &Value, field: &'static str) -> Result<(), ValidationError> {
    match raw.get(field).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err(ValidationError::EmptyField(field)),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
