//! Tool categories for approval/input timeout detection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::status::SessionStatus;
use crate::text::excerpt;

/// Longest tool detail kept on a log entry.
const MAX_DETAIL_CHARS: usize = 120;

/// How a tool behaves when nobody answers a permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    /// Completes instantly once approved; silence means a prompt is showing.
    Fast,
    /// Always stops for a human decision.
    Input,
    /// Network-bound, a few seconds when auto-approved.
    Medium,
    /// Shell commands that can legitimately run for minutes.
    Slow,
}

impl ToolCategory {
    /// Classifies a tool by name across Claude, Gemini and Codex spellings.
    ///
    /// Returns `None` for tools that may run indefinitely without a
    /// completion signal (subagents, MCP tools); those never get a timer.
    pub fn classify(tool_name: &str) -> Option<Self> {
        let name = tool_name.to_ascii_lowercase();
        match name.as_str() {
            "read" | "write" | "edit" | "multiedit" | "grep" | "glob" | "ls"
            | "notebookedit" | "notebookread" | "todowrite" | "read_file" | "write_file"
            | "replace" | "search_file_content" | "list_directory" | "read_many_files"
            | "apply_patch" => Some(Self::Fast),
            "askuserquestion" | "exitplanmode" | "ask_user" => Some(Self::Input),
            "webfetch" | "websearch" | "web_fetch" | "google_web_search" => Some(Self::Medium),
            "bash" | "run_shell_command" | "shell" | "exec_command" => Some(Self::Slow),
            _ => None,
        }
    }

    /// Status a session escalates to when this category's timer fires.
    pub fn escalates_to(&self) -> SessionStatus {
        match self {
            Self::Input => SessionStatus::Input,
            Self::Fast | Self::Medium | Self::Slow => SessionStatus::Approval,
        }
    }

    /// Whether a running child process should suppress escalation.
    pub fn checks_child_processes(&self) -> bool {
        matches!(self, Self::Slow)
    }
}

/// Timeout per tool category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolTimeouts {
    pub fast: Duration,
    pub input: Duration,
    pub medium: Duration,
    pub slow: Duration,
}

impl ToolTimeouts {
    pub fn for_category(&self, category: ToolCategory) -> Duration {
        match category {
            ToolCategory::Fast => self.fast,
            ToolCategory::Input => self.input,
            ToolCategory::Medium => self.medium,
            ToolCategory::Slow => self.slow,
        }
    }
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(3),
            input: Duration::from_secs(3),
            medium: Duration::from_secs(15),
            slow: Duration::from_secs(30),
        }
    }
}

/// Extracts a short human-readable detail from a tool's input.
///
/// The input shape varies per tool, so the first recognised field wins.
pub fn tool_detail(tool_input: &serde_json::Value) -> Option<String> {
    const FIELDS: [&str; 9] = [
        "file_path",
        "path",
        "absolute_path",
        "command",
        "pattern",
        "url",
        "query",
        "description",
        "prompt",
    ];

    let object = tool_input.as_object()?;
    FIELDS
        .iter()
        .filter_map(|field| object.get(*field))
        .find_map(|value| value.as_str())
        .map(|value| excerpt(value, MAX_DETAIL_CHARS))
}
