//! crew core - shared domain types for agent session tracking
//!
//! This crate provides the pure, I/O-free parts of the pipeline shared
//! between the daemon (crewd) and its wire protocol:
//! - `event` - canonical hook events and vendor name normalization
//! - `status` - session status, animation hints, source inference
//! - `tool` - tool categories driving the approval/input timeouts
//! - `session` - the session record and its state machine
//! - `team` - supervisor/subagent team record
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod event;
pub mod path;
pub mod ring;
pub mod session;
pub mod status;
pub mod team;
pub mod text;
pub mod tool;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use event::{EnvHints, EventInput, HookEventKind};
pub use path::{is_within, normalize_path, paths_related, project_name};
pub use ring::BoundedLog;
pub use session::{
    EventLogEntry, PreviousSession, PromptEntry, ResponseEntry, Session, SessionId, ToolLogEntry,
    Transition, HEAVY_TURN_TOOL_CALLS, MAX_EVENT_LOG, MAX_PREVIOUS_SESSIONS, MAX_PROMPT_HISTORY,
    MAX_RESPONSE_LOG, MAX_TOOL_LOG,
};
pub use status::{AnimationState, Emote, SessionSource, SessionStatus};
pub use team::{Team, TeamRole, TEAM_ID_PREFIX};
pub use tool::{tool_detail, ToolCategory, ToolTimeouts};
