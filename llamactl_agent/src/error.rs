//! Error taxonomy for the agent. Health-path errors are all non-fatal: they
//! degrade a snapshot, they never stop the monitor.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HealthError {
    /// One device metric could not be read this cycle.
    #[error("metric {metric} unavailable on {device}: {reason}")]
    MetricUnavailable {
        device: String,
        metric: &'static str,
        reason: String,
    },

    /// A PID disappeared between enumeration and inspection.
    #[error("process {0} vanished during scan")]
    ProcessScanPartial(u32),

    /// The process table could not be read at all; not the same as empty.
    #[error("process scan failed: {0}")]
    ProcessScanFailed(String),

    #[error("log source unavailable: {0}")]
    LogScanUnavailable(String),

    #[error("poll cycle failed: {0}")]
    PollCycleFailed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("launch error: {0}")]
    Launch(String),
}

pub type Result<T> = std::result::Result<T, HealthError>;

impl HealthError {
    pub fn log_unavailable<S: Into<String>>(msg: S) -> Self {
        HealthError::LogScanUnavailable(msg.into())
    }

    pub fn scan_failed<S: Into<String>>(msg: S) -> Self {
        HealthError::ProcessScanFailed(msg.into())
    }

    pub fn poll_cycle<S: Into<String>>(msg: S) -> Self {
        HealthError::PollCycleFailed(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        HealthError::Config(msg.into())
    }

    pub fn launch<S: Into<String>>(msg: S) -> Self {
        HealthError::Launch(msg.into())
    }
}
