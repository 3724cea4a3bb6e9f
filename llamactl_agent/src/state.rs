//! Shared agent state: the health monitor, the supervised server and the
//! last known server status for lock-free status replies.

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::launcher::{ServerLauncher, ServerStatus, SharedLogs};
use crate::monitor::HealthMonitor;

pub type SharedLauncher = Arc<Mutex<ServerLauncher>>;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<HealthMonitor>,
    // Held across start/stop; handlers that must not wait use `last_status`.
    pub launcher: SharedLauncher,
    pub last_status: Arc<std::sync::Mutex<ServerStatus>>,
    // Server output, readable while the launcher is busy
    pub logs: SharedLogs,
    pub settings_path: Arc<PathBuf>,
    pub model_dir: Arc<PathBuf>,

    pub client_count: Arc<AtomicUsize>,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        launcher: ServerLauncher,
        settings_path: PathBuf,
        auth_token: Option<String>,
    ) -> Self {
        let logs = launcher.logs();
        let model_dir = Arc::new(launcher.model_dir().to_path_buf());
        Self {
            monitor,
            launcher: Arc::new(Mutex::new(launcher)),
            last_status: Arc::new(std::sync::Mutex::new(ServerStatus {
                running: false,
                pid: None,
                model: None,
            })),
            logs,
            settings_path: Arc::new(settings_path),
            model_dir,
            client_count: Arc::new(AtomicUsize::new(0)),
            auth_token,
        }
    }

    /// Live monitor and launcher sharing one process table.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self> {
        let monitor = HealthMonitor::from_config(cfg)?;
        let launcher = ServerLauncher::from_config(cfg, monitor.scanner().clone());
        Ok(Self::new(
            Arc::new(monitor),
            launcher,
            cfg.settings_file(),
            cfg.auth_token.clone(),
        ))
    }

    /// Current server status, or the last known one while a start/stop is in flight.
    pub fn server_status(&self) -> ServerStatus {
        match self.launcher.try_lock() {
            Ok(mut l) => {
                let s = l.status();
                self.remember(&s);
                s
            }
            Err(_) => self.last_status.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        }
    }

    pub fn remember(&self, status: &ServerStatus) {
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = status.clone();
    }
}
