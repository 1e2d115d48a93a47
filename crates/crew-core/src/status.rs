//! Session status, presentation hints and source classification.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::event::EnvHints;

// ============================================================================
// Session Status
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Started, or nothing happened for a while.
    #[default]
    Idle,
    /// A prompt was submitted and the agent is thinking.
    Prompting,
    /// A tool call is in flight.
    Working,
    /// A tool call is believed to be blocked on a human approval.
    Approval,
    /// The agent asked the human a question.
    Input,
    /// The turn finished and the agent is waiting for the next prompt.
    Waiting,
    /// Placeholder or pending resume; no hook has arrived yet.
    Connecting,
    /// The session is over.
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Prompting => "prompting",
            Self::Working => "working",
            Self::Approval => "approval",
            Self::Input => "input",
            Self::Waiting => "waiting",
            Self::Connecting => "connecting",
            Self::Ended => "ended",
        }
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Returns true if a human is expected to act.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::Approval | Self::Input)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Presentation Hints
// ============================================================================

/// Character animation a dashboard should play for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationState {
    #[default]
    Idle,
    Walking,
    Running,
    Waiting,
    Dance,
    Death,
}

/// One-shot emote layered over the animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emote {
    Wave,
    ThumbsUp,
    Celebrate,
    Question,
}

// ============================================================================
// Session Source
// ============================================================================

/// Where the agent is running, inferred from environment markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSource {
    /// Provisioned by the remote-terminal manager.
    Ssh,
    Vscode,
    Jetbrains,
    Iterm,
    Kitty,
    Wezterm,
    Ghostty,
    Warp,
    AppleTerminal,
    Tmux,
    Zellij,
    #[default]
    Terminal,
}

impl SessionSource {
    /// Infers the source from terminal and editor markers.
    ///
    /// Editor integrations win over the terminal program they embed, and a
    /// multiplexer is only reported when no emulator identifies itself.
    pub fn infer(hints: &EnvHints) -> Self {
        let program = hints
            .term_program
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let emulator = hints
            .terminal_emulator
            .as_deref()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if hints.vscode || program == "vscode" || program.contains("cursor") {
            return Self::Vscode;
        }
        if hints.jetbrains || emulator.contains("jetbrains") {
            return Self::Jetbrains;
        }
        if hints.iterm_session_id.is_some() || program.starts_with("iterm") {
            return Self::Iterm;
        }
        if hints.kitty_window_id.is_some() || program == "kitty" {
            return Self::Kitty;
        }
        if hints.wezterm_pane.is_some() || program == "wezterm" {
            return Self::Wezterm;
        }
        if program == "ghostty" {
            return Self::Ghostty;
        }
        if program.starts_with("warp") {
            return Self::Warp;
        }
        if program == "apple_terminal" {
            return Self::AppleTerminal;
        }
        if hints.tmux_pane.is_some() || program == "tmux" {
            return Self::Tmux;
        }
        if hints.zellij_session.is_some() {
            return Self::Zellij;
        }
        Self::Terminal
    }
}
