//! Persisted launch parameters for the supervised server.
//! Missing keys fall back to defaults; a corrupt file is ignored.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{HealthError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// File name under the model dir, e.g. "qwen2.5-7b-q4_k_m.gguf".
    pub model: Option<String>,
    pub port: u16,
    pub host: String,
    /// GPU layers to offload; 999 means all.
    pub ngl: u32,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub ubatch_size: u32,
    pub main_gpu: u32,
    pub tensor_split: String,
    /// "on", "off" or "auto".
    pub flash_attn: String,
    pub parallel: u32,
    pub cont_batching: bool,
    /// Whitespace-separated, appended verbatim.
    pub extra_args: String,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            model: None,
            port: 4000,
            host: "0.0.0.0".into(),
            ngl: 999,
            ctx_size: 16384,
            batch_size: 512,
            ubatch_size: 128,
            main_gpu: 0,
            tensor_split: "1,0.4".into(),
            flash_attn: "on".into(),
            parallel: 1,
            cont_batching: true,
            extra_args: "--jinja --chat-template chatml".into(),
        }
    }
}

impl LaunchSettings {
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(s) => match serde_json::from_str::<LaunchSettings>(&s) {
                Ok(settings) => {
                    debug!("loaded launch settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    warn!("ignoring corrupt settings file {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!("failed to read {}: {e}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HealthError::config(e.to_string()))?;
        fs::write(path, json)?;
        debug!("saved launch settings to {}", path.display());
        Ok(())
    }

    pub fn extra_args(&self) -> impl Iterator<Item = &str> {
        self.extra_args.split_whitespace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "model": "m.gguf", "ctx_size": 4096 }"#).unwrap();

        let s = LaunchSettings::load(&path);
        assert_eq!(s.model.as_deref(), Some("m.gguf"));
        assert_eq!(s.ctx_size, 4096);
        assert_eq!(s.ngl, 999);
        assert_eq!(s.tensor_split, "1,0.4");
        assert!(s.cont_batching);
    }

    #[test]
    fn missing_or_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            LaunchSettings::load(&dir.path().join("absent.json")),
            LaunchSettings::default()
        );
        let path = dir.path().join("bad.json");
        fs::write(&path, "][").unwrap();
        assert_eq!(LaunchSettings::load(&path), LaunchSettings::default());
    }

    #[test]
    fn save_creates_parent_dirs_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let s = LaunchSettings {
            model: Some("x.gguf".into()),
            parallel: 4,
            ..Default::default()
        };
        s.save(&path).unwrap();
        assert_eq!(LaunchSettings::load(&path), s);
    }

    #[test]
    fn extra_args_split_on_whitespace() {
        let s = LaunchSettings {
            extra_args: "  --jinja   -ctk q8_0 ".into(),
            ..Default::default()
        };
        assert_eq!(s.extra_args().collect::<Vec<_>>(), vec!["--jinja", "-ctk", "q8_0"]);
    }
}
