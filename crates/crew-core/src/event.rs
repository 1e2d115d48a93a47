//! Canonical hook event taxonomy.
//!
//! Every vendor spelling is mapped onto [`HookEventKind`] at the transport
//! boundary; nothing past the validator ever matches on event-name strings.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Event Kinds
// ============================================================================

/// Canonical lifecycle events emitted by agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEventKind {
    SessionStart,
    UserPromptSubmit,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    PermissionRequest,
    Stop,
    SubagentStart,
    SubagentStop,
    TeammateIdle,
    TaskCompleted,
    PreCompact,
    Notification,
    SessionEnd,
}

impl HookEventKind {
    /// All canonical kinds, in lifecycle order.
    pub const ALL: [HookEventKind; 14] = [
        Self::SessionStart,
        Self::UserPromptSubmit,
        Self::PreToolUse,
        Self::PostToolUse,
        Self::PostToolUseFailure,
        Self::PermissionRequest,
        Self::Stop,
        Self::SubagentStart,
        Self::SubagentStop,
        Self::TeammateIdle,
        Self::TaskCompleted,
        Self::PreCompact,
        Self::Notification,
        Self::SessionEnd,
    ];

    /// Normalizes a vendor event name onto the canonical set.
    ///
    /// Matching ignores case and separators, so `SessionStart`,
    /// `session-start` and `session_start` are the same event. Gemini and
    /// Codex names are folded onto their Claude equivalents.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let key: String = name
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .map(|c| c.to_ascii_lowercase())
            .collect();

        match key.as_str() {
            "sessionstart" => Some(Self::SessionStart),
            "userpromptsubmit" | "beforeagent" => Some(Self::UserPromptSubmit),
            "pretooluse" | "beforetool" => Some(Self::PreToolUse),
            "posttooluse" | "aftertool" => Some(Self::PostToolUse),
            "posttoolusefailure" => Some(Self::PostToolUseFailure),
            "permissionrequest" => Some(Self::PermissionRequest),
            "stop" | "afteragent" | "agentturncomplete" => Some(Self::Stop),
            "subagentstart" => Some(Self::SubagentStart),
            "subagentstop" => Some(Self::SubagentStop),
            "teammateidle" => Some(Self::TeammateIdle),
            "taskcompleted" => Some(Self::TaskCompleted),
            "precompact" | "precompress" => Some(Self::PreCompact),
            "notification" => Some(Self::Notification),
            "sessionend" => Some(Self::SessionEnd),
            _ => None,
        }
    }

    /// Like [`from_event_name`](Self::from_event_name) but with a domain error.
    pub fn parse(name: &str) -> DomainResult<Self> {
        Self::from_event_name(name).ok_or_else(|| DomainError::UnknownEvent {
            name: name.to_string(),
        })
    }

    /// Canonical kebab-case name, as used in logs and deltas.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStart => "session-start",
            Self::UserPromptSubmit => "user-prompt-submit",
            Self::PreToolUse => "pre-tool-use",
            Self::PostToolUse => "post-tool-use",
            Self::PostToolUseFailure => "post-tool-use-failure",
            Self::PermissionRequest => "permission-request",
            Self::Stop => "stop",
            Self::SubagentStart => "subagent-start",
            Self::SubagentStop => "subagent-stop",
            Self::TeammateIdle => "teammate-idle",
            Self::TaskCompleted => "task-completed",
            Self::PreCompact => "pre-compact",
            Self::Notification => "notification",
            Self::SessionEnd => "session-end",
        }
    }

    /// Events that only annotate the log without moving the status.
    pub fn is_annotation(&self) -> bool {
        matches!(
            self,
            Self::TeammateIdle | Self::TaskCompleted | Self::PreCompact | Self::Notification
        )
    }

    /// Events that resolve a pending tool call one way or another.
    pub fn settles_tool(&self) -> bool {
        matches!(
            self,
            Self::PostToolUse
                | Self::PostToolUseFailure
                | Self::PermissionRequest
                | Self::Stop
                | Self::SessionEnd
        )
    }
}

impl fmt::Display for HookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event Input
// ============================================================================

/// Terminal and editor markers that hook scripts copy from their environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvHints {
    /// `$TERM_PROGRAM` (e.g. "iTerm.app", "vscode", "WezTerm")
    pub term_program: Option<String>,
    /// `$TERMINAL_EMULATOR` (JetBrains sets "JetBrains-JediTerm")
    pub terminal_emulator: Option<String>,
    pub iterm_session_id: Option<String>,
    pub kitty_window_id: Option<String>,
    pub wezterm_pane: Option<String>,
    pub tmux_pane: Option<String>,
    pub zellij_session: Option<String>,
    pub vscode: bool,
    pub jetbrains: bool,
}

/// The parts of a hook payload the state machine consumes.
///
/// Decoded from the wire by the protocol crate; kept here so the state
/// machine has no dependency on transport shapes.
#[derive(Debug, Clone, Default)]
pub struct EventInput {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub prompt: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub transcript_path: Option<String>,
    pub permission_mode: Option<String>,
    pub agent_type: Option<String>,
    pub agent_name: Option<String>,
    pub agent_id: Option<String>,
    pub message: Option<String>,
}

impl EventInput {
    /// Creates an input that only carries a working directory.
    pub fn with_cwd(cwd: impl Into<String>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }

    /// Creates an input that only carries a tool name.
    pub fn with_tool(tool: impl Into<String>) -> Self {
        Self {
            tool_name: Some(tool.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claude_names_normalize() {
        assert_eq!(
            HookEventKind::from_event_name("PreToolUse"),
            Some(HookEventKind::PreToolUse)
        );
        assert_eq!(
            HookEventKind::from_event_name("PostToolUseFailure"),
            Some(HookEventKind::PostToolUseFailure)
        );
        assert_eq!(
            HookEventKind::from_event_name("SessionEnd"),
            Some(HookEventKind::SessionEnd)
        );
    }

    #[test]
    fn test_separator_and_case_insensitive() {
        assert_eq!(
            HookEventKind::from_event_name("session-start"),
            Some(HookEventKind::SessionStart)
        );
        assert_eq!(
            HookEventKind::from_event_name("pre_tool_use"),
            Some(HookEventKind::PreToolUse)
        );
        assert_eq!(
            HookEventKind::from_event_name("STOP"),
            Some(HookEventKind::Stop)
        );
    }

    #[test]
    fn test_vendor_aliases() {
        assert_eq!(
            HookEventKind::from_event_name("BeforeTool"),
            Some(HookEventKind::PreToolUse)
        );
        assert_eq!(
            HookEventKind::from_event_name("AfterAgent"),
            Some(HookEventKind::Stop)
        );
        assert_eq!(
            HookEventKind::from_event_name("PreCompress"),
            Some(HookEventKind::PreCompact)
        );
        assert_eq!(
            HookEventKind::from_event_name("agent-turn-complete"),
            Some(HookEventKind::Stop)
        );
    }

    #[test]
    fn test_unknown_event() {
        assert_eq!(HookEventKind::from_event_name("BeforeModel"), None);
        assert_eq!(HookEventKind::from_event_name(""), None);
        assert!(HookEventKind::parse("nope").is_err());
    }

    #[test]
    fn test_canonical_names_round_trip_through_normalization() {
        for kind in HookEventKind::ALL {
            assert_eq!(HookEventKind::from_event_name(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&HookEventKind::PostToolUseFailure).unwrap();
        assert_eq!(json, "\"post-tool-use-failure\"");
    }

    #[test]
    fn test_classification() {
        assert!(HookEventKind::Notification.is_annotation());
        assert!(!HookEventKind::Stop.is_annotation());
        assert!(HookEventKind::PermissionRequest.settles_tool());
        assert!(!HookEventKind::PreToolUse.settles_tool());
    }
}
