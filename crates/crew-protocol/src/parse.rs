//! Decoding hook payloads from any vendor and transport.
//!
//! A payload is validated first (see [`crate::validate`]) and then decoded
//! into [`HookPayload`]. Unknown fields are ignored; vendors add fields
//! faster than anyone can list them.

use crew_core::{EnvHints, EventInput, HookEventKind, SessionId};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::validate::{event_name, validate, ValidationError};

/// Epoch values below this are seconds rather than milliseconds.
const SECONDS_EPOCH_CEILING: f64 = 100_000_000_000.0;

/// Fields of a hook payload, as sent by hook scripts.
///
/// All optional fields use `#[serde(default)]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookFields {
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// A plain model id, or an object with `id`/`display_name`.
    #[serde(default)]
    pub model: Option<Value>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default, alias = "last-assistant-message", alias = "last_assistant_message")]
    pub response: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub claude_pid: Option<u32>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub hook_sent_at: Option<f64>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub permission_mode: Option<String>,

    // team correlation
    #[serde(default)]
    pub parent_session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
    #[serde(default)]
    pub team_name: Option<String>,

    // terminal correlation
    #[serde(default, deserialize_with = "lenient_string")]
    pub terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub agent_terminal_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tmux_pane: Option<String>,
    #[serde(default)]
    pub term_program: Option<String>,
    #[serde(default)]
    pub terminal_emulator: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub iterm_session_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub kitty_window_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub wezterm_pane: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub zellij_session: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub vscode: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub jetbrains: bool,
}

/// A validated hook payload with its canonical event kind.
#[derive(Debug, Clone)]
pub struct HookPayload {
    pub kind: HookEventKind,
    /// Event name exactly as the producer spelled it.
    pub raw_event: String,
    pub fields: HookFields,
}

impl HookPayload {
    /// Validates and decodes an envelope.
    pub fn decode(value: Value) -> Result<Self, ValidationError> {
        validate(&value)?;

        let raw_event = value
            .as_object()
            .and_then(event_name)
            .ok_or(ValidationError::MissingEventName)?
            .to_string();
        let kind = HookEventKind::parse(&raw_event)
            .map_err(|_| ValidationError::UnknownEvent(raw_event.clone()))?;

        let fields: HookFields = serde_json::from_value(value)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        Ok(Self {
            kind,
            raw_event,
            fields,
        })
    }

    /// Decodes one line of JSON text.
    pub fn decode_str(line: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(line).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::decode(value)
    }

    pub fn session_id(&self) -> SessionId {
        SessionId::new(self.fields.session_id.clone())
    }

    /// Process id of the agent CLI, from either pid field.
    pub fn pid(&self) -> Option<u32> {
        self.fields.claude_pid.or(self.fields.pid)
    }

    /// Externally assigned terminal id, from either field.
    pub fn terminal_id(&self) -> Option<&str> {
        self.fields
            .terminal_id
            .as_deref()
            .or(self.fields.agent_terminal_id.as_deref())
    }

    pub fn parent_session_id(&self) -> Option<SessionId> {
        self.fields
            .parent_session_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(SessionId::new)
    }

    pub fn cwd(&self) -> Option<&str> {
        self.fields.cwd.as_deref().filter(|c| !c.is_empty())
    }

    /// Model name, whichever shape the vendor sent.
    pub fn model_name(&self) -> Option<String> {
        match self.fields.model.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(obj) => obj
                .get("display_name")
                .or_else(|| obj.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Producer-side send time in epoch milliseconds.
    ///
    /// Accepts seconds or milliseconds; small values are taken as seconds.
    pub fn sent_at_ms(&self) -> Option<i64> {
        let raw = self.fields.hook_sent_at?;
        if !raw.is_finite() || raw <= 0.0 {
            return None;
        }
        let ms = if raw < SECONDS_EPOCH_CEILING {
            raw * 1000.0
        } else {
            raw
        };
        Some(ms as i64)
    }

    pub fn env_hints(&self) -> EnvHints {
        let f = &self.fields;
        EnvHints {
            term_program: f.term_program.clone(),
            terminal_emulator: f.terminal_emulator.clone(),
            iterm_session_id: f.iterm_session_id.clone(),
            kitty_window_id: f.kitty_window_id.clone(),
            wezterm_pane: f.wezterm_pane.clone(),
            tmux_pane: f.tmux_pane.clone(),
            zellij_session: f.zellij_session.clone(),
            vscode: f.vscode,
            jetbrains: f.jetbrains,
        }
    }

    /// Projects the payload onto what the state machine reads.
    pub fn event_input(&self) -> EventInput {
        let f = &self.fields;
        EventInput {
            cwd: self.cwd().map(str::to_string),
            model: self.model_name(),
            tool_name: f.tool_name.clone(),
            tool_input: f.tool_input.clone(),
            prompt: f.prompt.clone(),
            response: f.response.clone(),
            error: f.error.clone().or_else(|| tool_response_error(f.tool_response.as_ref())),
            transcript_path: f.transcript_path.clone(),
            permission_mode: f.permission_mode.clone(),
            agent_type: f.agent_type.clone(),
            agent_name: f.agent_name.clone(),
            agent_id: f.agent_id.clone(),
            message: f.message.clone(),
        }
    }
}

/// Error text some vendors nest inside `tool_response`.
fn tool_response_error(response: Option<&Value>) -> Option<String> {
    let response = response?;
    response
        .get("error")
        .or_else(|| response.get("stderr"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Correlation hints arrive as strings or bare numbers depending on how the
/// hook script quoted its environment. Other shapes are dropped.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts `true`, `1`, `"1"`, `"true"` as true; anything else as false.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_numeric_terminal_hints_are_accepted() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1",
            "event": "session-start",
            "kitty_window_id": 3,
            "wezterm_pane": 17,
            "terminal_id": 42,
            "tmux_pane": "%4",
            "iterm_session_id": null,
            "zellij_session": {"name": "ignored"},
        }))
        .unwrap();

        assert_eq!(payload.terminal_id(), Some("42"));
        let hints = payload.env_hints();
        assert_eq!(hints.kitty_window_id.as_deref(), Some("3"));
        assert_eq!(hints.wezterm_pane.as_deref(), Some("17"));
        assert_eq!(hints.tmux_pane.as_deref(), Some("%4"));
        assert!(hints.iterm_session_id.is_none());
        assert!(hints.zellij_session.is_none());
    }

    #[test]
    fn test_decode_claude_pre_tool_use() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1",
            "hook_event_name": "PreToolUse",
            "cwd": "/proj",
            "tool_name": "Read",
            "tool_input": {"file_path": "/a"},
            "claude_pid": 4242
        }))
        .unwrap();

        assert_eq!(payload.kind, HookEventKind::PreToolUse);
        assert_eq!(payload.raw_event, "PreToolUse");
        assert_eq!(payload.session_id().as_str(), "s1");
        assert_eq!(payload.pid(), Some(4242));
        assert_eq!(payload.cwd(), Some("/proj"));
        assert_eq!(payload.event_input().tool_name.as_deref(), Some("Read"));
    }

    #[test]
    fn test_decode_uses_event_alias() {
        let payload =
            HookPayload::decode(json!({"session_id": "s2", "event": "session-start"})).unwrap();
        assert_eq!(payload.kind, HookEventKind::SessionStart);
    }

    #[test]
    fn test_decode_rejects_invalid() {
        let err = HookPayload::decode(json!({"session_id": "s2"})).unwrap_err();
        assert_eq!(err, ValidationError::MissingEventName);
    }

    #[test]
    fn test_decode_malformed_field_type() {
        let err = HookPayload::decode(json!({
            "session_id": "s1",
            "event": "stop",
            "cwd": 12
        }))
        .unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_decode_str_bad_json() {
        let err = HookPayload::decode_str("{\"session_id\":\"s2\",\"event\":\"sto").unwrap_err();
        assert!(matches!(err, ValidationError::Malformed(_)));
    }

    #[test]
    fn test_pid_falls_back_to_pid_field() {
        let payload =
            HookPayload::decode(json!({"session_id": "s1", "event": "stop", "pid": 77})).unwrap();
        assert_eq!(payload.pid(), Some(77));
    }

    #[test]
    fn test_model_name_shapes() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1", "event": "session-start", "model": "claude-sonnet-4"
        }))
        .unwrap();
        assert_eq!(payload.model_name().as_deref(), Some("claude-sonnet-4"));

        let payload = HookPayload::decode(json!({
            "session_id": "s1", "event": "session-start",
            "model": {"id": "gemini-2.5-pro"}
        }))
        .unwrap();
        assert_eq!(payload.model_name().as_deref(), Some("gemini-2.5-pro"));
    }

    #[test]
    fn test_sent_at_accepts_seconds_and_millis() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1", "event": "stop", "hook_sent_at": 1_700_000_000
        }))
        .unwrap();
        assert_eq!(payload.sent_at_ms(), Some(1_700_000_000_000));

        let payload = HookPayload::decode(json!({
            "session_id": "s1", "event": "stop", "hook_sent_at": 1_700_000_000_123u64
        }))
        .unwrap();
        assert_eq!(payload.sent_at_ms(), Some(1_700_000_000_123));
    }

    #[test]
    fn test_terminal_hints() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1",
            "event": "session-start",
            "agent_terminal_id": "t1",
            "term_program": "iTerm.app",
            "vscode": "0",
            "jetbrains": 1
        }))
        .unwrap();
        assert_eq!(payload.terminal_id(), Some("t1"));
        let hints = payload.env_hints();
        assert_eq!(hints.term_program.as_deref(), Some("iTerm.app"));
        assert!(!hints.vscode);
        assert!(hints.jetbrains);
    }

    #[test]
    fn test_codex_turn_complete() {
        let payload = HookPayload::decode(json!({
            "session_id": "codex-1",
            "event": "agent-turn-complete",
            "last-assistant-message": "Done."
        }))
        .unwrap();
        assert_eq!(payload.kind, HookEventKind::Stop);
        assert_eq!(payload.event_input().response.as_deref(), Some("Done."));
    }

    #[test]
    fn test_failure_error_from_tool_response() {
        let payload = HookPayload::decode(json!({
            "session_id": "s1",
            "event": "post-tool-use-failure",
            "tool_name": "Bash",
            "tool_response": {"stderr": "command not found"}
        }))
        .unwrap();
        assert_eq!(
            payload.event_input().error.as_deref(),
            Some("command not found")
        );
    }

    #[test]
    fn test_empty_parent_session_ignored() {
        let payload = HookPayload::decode(json!({
            "session_id": "c1", "event": "session-start", "parent_session_id": ""
        }))
        .unwrap();
        assert!(payload.parent_session_id().is_none());
    }
}
