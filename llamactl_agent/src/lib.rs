//! llamactl agent: supervises a local llama-server, serves its controls
//! over HTTP/WebSocket and watches the GPUs for hangs.

pub mod cli;
pub mod config;
pub mod device;
pub mod diagnosis;
pub mod error;
pub mod http;
pub mod launcher;
pub mod lifecycle;
pub mod logs;
pub mod monitor;
pub mod process;
pub mod settings;
pub mod state;
pub mod types;
pub mod ws;

pub use error::{HealthError, Result};
pub use monitor::{HealthMonitor, MonitorSettings, MonitorState};
pub use types::{Diagnosis, HealthSnapshot, Severity};
