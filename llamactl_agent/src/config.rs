//! Agent configuration: JSON file under the XDG config dir, then
//! `LLAMACTL_AGENT_*` environment overrides, then CLI flags (see main.rs).
//! Stored at $XDG_CONFIG_HOME/llamactl_agent/config.json (fallback ~/.config/llamactl_agent/config.json)

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::error::{HealthError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// sysfs card id, e.g. "card1"
    pub id: String,
    pub name: String,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogSourceKind {
    #[default]
    Journal,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub source: LogSourceKind,
    /// Used when `source` is `file` (e.g. /var/log/kern.log).
    pub file: Option<PathBuf>,
    /// How far back the window reaches.
    pub since_minutes: u64,
    /// Hard cap on lines pulled per scan.
    pub max_lines: usize,
    pub command_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            source: LogSourceKind::Journal,
            file: None,
            since_minutes: 10,
            max_lines: 500,
            command_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPatternConfig {
    pub code: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub binary: PathBuf,
    pub model_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub slots_dir: PathBuf,
    pub stop_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let home = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            binary: PathBuf::from("/usr/local/bin/llama-server"),
            model_dir: home.join("models"),
            cache_dir: home.join(".cache").join("llama"),
            slots_dir: PathBuf::from("/tmp/llama_slots"),
            stop_grace_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    pub devices: Vec<DeviceConfig>,
    pub sysfs_root: PathBuf,
    /// Name (substring) of the supervised server binary.
    pub process_name: String,
    pub poll_interval_ms: u64,
    pub diagnosis_interval_secs: u64,
    pub metric_timeout_ms: u64,
    pub log: LogConfig,
    /// Replaces the built-in kernel log patterns when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_patterns: Option<Vec<LogPatternConfig>>,
    pub server: ServerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_path: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            auth_token: None,
            devices: vec![
                DeviceConfig::new("card1", "RX 470"),
                DeviceConfig::new("card2", "RX 6600"),
            ],
            sysfs_root: PathBuf::from("/sys"),
            process_name: "llama-server".into(),
            poll_interval_ms: 2_000,
            diagnosis_interval_secs: 30,
            metric_timeout_ms: 250,
            log: LogConfig::default(),
            log_patterns: None,
            server: ServerConfig::default(),
            settings_path: None,
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn diagnosis_interval(&self) -> Duration {
        Duration::from_secs(self.diagnosis_interval_secs)
    }

    pub fn metric_timeout(&self) -> Duration {
        Duration::from_millis(self.metric_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.server.stop_grace_ms)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(|| config_dir().join("settings.json"))
    }

    /// Apply `LLAMACTL_AGENT_*` overrides. `get` is the env lookup (injected for tests).
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str| get(key).and_then(|v| v.trim().parse::<u64>().ok());

        if let Some(v) = get("LLAMACTL_AGENT_PORT").and_then(|v| v.parse().ok()) {
            self.port = v;
        }
        if let Some(v) = get("LLAMACTL_AGENT_TOKEN").filter(|t| !t.is_empty()) {
            self.auth_token = Some(v);
        }
        if let Some(v) = parse_u64("LLAMACTL_AGENT_POLL_MS") {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse_u64("LLAMACTL_AGENT_DIAG_SECS") {
            self.diagnosis_interval_secs = v;
        }
        if let Some(v) = parse_u64("LLAMACTL_AGENT_METRIC_TIMEOUT_MS") {
            self.metric_timeout_ms = v;
        }
        if let Some(v) = get("LLAMACTL_AGENT_SYSFS_ROOT") {
            self.sysfs_root = PathBuf::from(v);
        }
        if let Some(v) = get("LLAMACTL_AGENT_PROCESS_NAME").filter(|s| !s.is_empty()) {
            self.process_name = v;
        }
        if let Some(v) = get("LLAMACTL_AGENT_LOG_FILE") {
            self.log.source = LogSourceKind::File;
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = parse_u64("LLAMACTL_AGENT_LOG_SINCE_MIN") {
            self.log.since_minutes = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.iter().any(|d| d.id.is_empty()) {
            return Err(HealthError::config("device id must not be empty"));
        }
        if self.process_name.trim().is_empty() {
            return Err(HealthError::config("process_name must not be empty"));
        }
        if self.log.source == LogSourceKind::File && self.log.file.is_none() {
            return Err(HealthError::config("log.source = file requires log.file"));
        }
        Ok(())
    }
}

pub fn config_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("llamactl_agent")
    } else {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llamactl_agent")
    }
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load config from `path` (or the default location). A missing default file
/// yields defaults; a missing explicit file or malformed JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_path(), false),
    };
    let cfg = match fs::read_to_string(&path) {
        Ok(s) => serde_json::from_str::<AgentConfig>(&s)
            .map_err(|e| HealthError::config(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => AgentConfig::default(),
        Err(e) => return Err(e.into()),
    };
    cfg.validate()?;
    Ok(cfg)
}
