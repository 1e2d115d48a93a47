//! Structural checks on an inbound hook envelope.
//!
//! Runs before anything else touches the payload. Checks are ordered and
//! short-circuit on the first failure; a rejected payload is never applied.

use crew_core::HookEventKind;
use serde_json::{Map, Value};
use thiserror::Error;

/// Longest accepted `session_id`, in characters.
pub const MAX_SESSION_ID_LEN: usize = 256;

/// Fields that may carry the event name, in precedence order.
pub const EVENT_NAME_FIELDS: [&str; 3] = ["hook_event_name", "event", "event_name"];

/// Fields that may carry the agent's process id.
pub const PID_FIELDS: [&str; 2] = ["claude_pid", "pid"];

/// Fields that must be numeric when present.
pub const TIMESTAMP_FIELDS: [&str; 2] = ["timestamp", "hook_sent_at"];

/// Why a payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing session_id")]
    MissingSessionId,

    #[error("session_id must be a string")]
    SessionIdNotText,

    #[error("session_id too long ({len} chars, max {max})")]
    SessionIdTooLong { len: usize, max: usize },

    #[error("missing event name (expected one of hook_event_name, event, event_name)")]
    MissingEventName,

    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("{field} must be a positive integer, got {value}")]
    InvalidPid { field: &'static str, value: String },

    #[error("{field} must be numeric, got {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Validates a decoded envelope. `Ok(())` means the caller may proceed.
pub fn validate(payload: &Value) -> Result<(), ValidationError> {
    let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    check_session_id(object)?;
    check_event_name(object)?;

    for field in PID_FIELDS {
        if let Some(value) = present(object, field) {
            let valid = value
                .as_u64()
                .is_some_and(|pid| pid > 0 && pid <= u64::from(u32::MAX));
            if !valid {
                return Err(ValidationError::InvalidPid {
                    field,
                    value: value.to_string(),
                });
            }
        }
    }

    for field in TIMESTAMP_FIELDS {
        if let Some(value) = present(object, field) {
            if !value.is_number() {
                return Err(ValidationError::InvalidTimestamp {
                    field,
                    value: value.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Returns the raw event name, from the first populated name field.
pub fn event_name(object: &Map<String, Value>) -> Option<&str> {
    EVENT_NAME_FIELDS
        .iter()
        .filter_map(|field| present(object, field))
        .find_map(Value::as_str)
}

fn check_session_id(object: &Map<String, Value>) -> Result<(), ValidationError> {
    let value = present(object, "session_id").ok_or(ValidationError::MissingSessionId)?;
    let id = value.as_str().ok_or(ValidationError::SessionIdNotText)?;
    if id.is_empty() {
        return Err(ValidationError::MissingSessionId);
    }
    let len = id.chars().count();
    if len > MAX_SESSION_ID_LEN {
        return Err(ValidationError::SessionIdTooLong {
            len,
            max: MAX_SESSION_ID_LEN,
        });
    }
    Ok(())
}

fn check_event_name(object: &Map<String, Value>) -> Result<(), ValidationError> {
    let name = event_name(object).ok_or(ValidationError::MissingEventName)?;
    HookEventKind::from_event_name(name)
        .map(|_| ())
        .ok_or_else(|| ValidationError::UnknownEvent(name.to_string()))
}

/// A field counts as present unless it is missing or `null`.
fn present<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|v| !v.is_null())
}
