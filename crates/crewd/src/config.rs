//! Daemon configuration.
//!
//! Loaded from a TOML file (`$CREW_CONFIG`, else `<config_dir>/crew/crewd.toml`).
//! A missing file yields the defaults; every section and key is optional.
//! A few environment variables override the file afterwards.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crew_core::{SessionStatus, ToolTimeouts};

use crate::registry::RegistryConfig;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/crew.sock";
pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:7420";
pub const QUEUE_FILE_NAME: &str = "hooks.ndjson";

pub const ENV_CONFIG: &str = "CREW_CONFIG";
pub const ENV_SOCKET: &str = "CREW_SOCKET";
pub const ENV_HTTP_ADDR: &str = "CREW_HTTP_ADDR";
pub const ENV_QUEUE: &str = "CREW_QUEUE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidOverride { key: &'static str, value: String },
}

/// Top-level daemon settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub http_addr: SocketAddr,
    pub queue_path: PathBuf,
    pub timeouts: TimeoutConfig,
    pub sweeps: SweepConfig,
    pub idle: IdleConfig,
    pub queue: QueueConfig,
}

/// Approval/input timeouts per tool category, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub fast_secs: u64,
    pub input_secs: u64,
    pub medium_secs: u64,
    pub slow_secs: u64,
}

/// Cadence of the periodic sweeps, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub liveness_secs: u64,
    pub auto_idle_secs: u64,
    pub resume_expiry_secs: u64,
}

/// Inactivity before a session falls back to idle, per status, in seconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub prompting_secs: u64,
    pub working_secs: u64,
    pub waiting_secs: u64,
}

/// File-queue reader tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_ms: u64,
    pub debounce_ms: u64,
    pub health_secs: u64,
    pub truncate_bytes: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            queue_path: default_state_dir().join(QUEUE_FILE_NAME),
            timeouts: TimeoutConfig::default(),
            sweeps: SweepConfig::default(),
            idle: IdleConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            fast_secs: 3,
            input_secs: 3,
            medium_secs: 15,
            slow_secs: 30,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            liveness_secs: 15,
            auto_idle_secs: 10,
            resume_expiry_secs: 10,
        }
    }
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            prompting_secs: 300,
            working_secs: 600,
            waiting_secs: 900,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_ms: 500,
            debounce_ms: 10,
            health_secs: 5,
            truncate_bytes: 1_048_576,
        }
    }
}

impl DaemonConfig {
    /// Loads the config file (if any) and applies environment overrides.
    ///
    /// `explicit` wins over `$CREW_CONFIG`, which wins over the default path.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG).map(PathBuf::from))
            .or_else(default_config_path);

        let mut config = match path {
            Some(ref path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from a key lookup (the environment, in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(ENV_SOCKET).filter(|v| !v.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(addr) = lookup(ENV_HTTP_ADDR).filter(|v| !v.is_empty()) {
            self.http_addr = addr.parse().map_err(|_| ConfigError::InvalidOverride {
                key: ENV_HTTP_ADDR,
                value: addr.clone(),
            })?;
        }
        if let Some(queue) = lookup(ENV_QUEUE).filter(|v| !v.is_empty()) {
            self.queue_path = PathBuf::from(queue);
        }
        Ok(())
    }

    pub fn tool_timeouts(&self) -> ToolTimeouts {
        ToolTimeouts {
            fast: Duration::from_secs(self.timeouts.fast_secs),
            input: Duration::from_secs(self.timeouts.input_secs),
            medium: Duration::from_secs(self.timeouts.medium_secs),
            slow: Duration::from_secs(self.timeouts.slow_secs),
        }
    }

    /// Settings the registry actor runs with.
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            tool_timeouts: self.tool_timeouts(),
            idle: self.idle,
            liveness_interval: Duration::from_secs(self.sweeps.liveness_secs),
            auto_idle_interval: Duration::from_secs(self.sweeps.auto_idle_secs),
            resume_expiry_interval: Duration::from_secs(self.sweeps.resume_expiry_secs),
            ..RegistryConfig::default()
        }
    }
}

impl IdleConfig {
    /// Inactivity threshold for a status, or `None` if it never auto-idles.
    pub fn threshold(&self, status: SessionStatus) -> Option<Duration> {
        match status {
            SessionStatus::Prompting => Some(Duration::from_secs(self.prompting_secs)),
            SessionStatus::Working => Some(Duration::from_secs(self.working_secs)),
            SessionStatus::Waiting => Some(Duration::from_secs(self.waiting_secs)),
            _ => None,
        }
    }
}

/// `<state_dir>/crew`, falling back to the temp dir on platforms without one.
pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("crew")
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("crew").join("crewd.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.http_addr.to_string(), DEFAULT_HTTP_ADDR);
        assert!(config.queue_path.ends_with(QUEUE_FILE_NAME));
        assert_eq!(config.tool_timeouts(), ToolTimeouts::default());
        assert_eq!(config.queue.truncate_bytes, 1_048_576);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            socket_path = "/run/crew.sock"

            [timeouts]
            slow_secs = 60

            [idle]
            waiting_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/crew.sock"));
        assert_eq!(config.timeouts.slow_secs, 60);
        assert_eq!(config.timeouts.fast_secs, 3);
        assert_eq!(config.idle.waiting_secs, 30);
        assert_eq!(config.idle.working_secs, 600);
        assert_eq!(config.sweeps.liveness_secs, 15);
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crewd.toml");
        std::fs::write(&path, "http_addr = 12").unwrap();

        let err = DaemonConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_missing_explicit_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.timeouts.medium_secs, 15);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SOCKET, "/tmp/other.sock"),
            (ENV_HTTP_ADDR, "0.0.0.0:9000"),
            (ENV_QUEUE, "/tmp/q.ndjson"),
        ]);
        let mut config = DaemonConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.queue_path, PathBuf::from("/tmp/q.ndjson"));
    }

    #[test]
    fn test_bad_http_override_is_rejected() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_HTTP_ADDR).then(|| "not-an-addr".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));
    }

    #[test]
    fn test_idle_thresholds() {
        let idle = IdleConfig::default();
        assert_eq!(
            idle.threshold(SessionStatus::Working),
            Some(Duration::from_secs(600))
        );
        assert_eq!(idle.threshold(SessionStatus::Approval), None);
        assert_eq!(idle.threshold(SessionStatus::Ended), None);
    }
}
