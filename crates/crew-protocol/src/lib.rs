//! crew protocol - hook payloads and the consumer wire format
//!
//! - `validate` - structural checks every inbound hook passes first
//! - `parse` - decoding validated payloads from any vendor
//! - `delta` - sequenced change records fanned out to consumers
//! - `message` - newline-delimited JSON messages on the daemon socket

pub mod delta;
pub mod message;
pub mod parse;
pub mod validate;
pub mod version;

pub use delta::{Delta, ReplayEntry};
pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use parse::{HookFields, HookPayload};
pub use validate::{validate, ValidationError, MAX_SESSION_ID_LEN};
pub use version::{ProtocolVersion, VersionError};
