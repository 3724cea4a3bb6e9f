//! Recent kernel/system log lines for the diagnosis engine.
//!
//! Scans are best effort and bounded: a line cap, a time window and a
//! command/read timeout. An unreachable source is reported, not escalated.

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::config::{LogConfig, LogSourceKind};
use crate::error::{HealthError, Result};

/// Input to the diagnosis engine's log check.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLines {
    /// Most recent first.
    Available(Vec<String>),
    Unavailable(String),
}

impl LogLines {
    pub fn empty() -> Self {
        LogLines::Available(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogWindow {
    pub since: Duration,
    pub max_lines: usize,
}

impl LogWindow {
    pub fn from_config(cfg: &LogConfig) -> Self {
        Self {
            since: Duration::from_secs(cfg.since_minutes.saturating_mul(60)),
            max_lines: cfg.max_lines,
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Up to `window.max_lines` lines, most recent first.
    async fn recent_lines(&self, window: &LogWindow) -> Result<Vec<String>>;
}

/// Fetch lines, turning any failure into `LogLines::Unavailable`.
pub async fn collect(source: &dyn LogSource, window: &LogWindow) -> LogLines {
    match source.recent_lines(window).await {
        Ok(mut lines) => {
            lines.truncate(window.max_lines);
            LogLines::Available(lines)
        }
        Err(e) => {
            warn!("log scan skipped: {e}");
            LogLines::Unavailable(e.to_string())
        }
    }
}

/// `journalctl` error-priority entries.
pub struct JournalSource {
    timeout: Duration,
}

impl JournalSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LogSource for JournalSource {
    async fn recent_lines(&self, window: &LogWindow) -> Result<Vec<String>> {
        let since = format!("{} seconds ago", window.since.as_secs().max(1));
        let lines = window.max_lines.to_string();
        let mut cmd = Command::new("journalctl");
        cmd.args([
            "--since",
            since.as_str(),
            "--priority=err",
            "--no-pager",
            "--quiet",
            "--reverse",
            "--lines",
            lines.as_str(),
        ])
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let out = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(HealthError::log_unavailable(format!("journalctl: {e}"))),
            Err(_) => {
                return Err(HealthError::log_unavailable(format!(
                    "journalctl timed out after {:?}",
                    self.timeout
                )))
            }
        };
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(HealthError::log_unavailable(format!(
                "journalctl exited with {}: {}",
                out.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(window.max_lines)
            .map(str::to_owned)
            .collect())
    }
}

/// Tail of a plain log file (e.g. /var/log/kern.log). Lines carry no parsed
/// timestamps, so only the line cap bounds the window.
pub struct FileSource {
    path: PathBuf,
    timeout: Duration,
}

// Average kernel log line is well under this; used to size the tail read.
const BYTES_PER_LINE: u64 = 256;

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    async fn tail(&self, max_lines: usize) -> std::io::Result<Vec<String>> {
        let mut f = tokio::fs::File::open(&self.path).await?;
        let len = f.metadata().await?.len();
        let want = (max_lines as u64).saturating_mul(BYTES_PER_LINE);
        let start = len.saturating_sub(want);
        f.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        f.read_to_end(&mut buf).await?;
        let text = String::from_utf8_lossy(&buf);
        let mut lines: Vec<&str> = text.lines().collect();
        if start > 0 && !lines.is_empty() {
            // first line is likely cut mid-way
            lines.remove(0);
        }
        Ok(lines
            .into_iter()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(max_lines)
            .map(str::to_owned)
            .collect())
    }
}

#[async_trait]
impl LogSource for FileSource {
    async fn recent_lines(&self, window: &LogWindow) -> Result<Vec<String>> {
        match timeout(self.timeout, self.tail(window.max_lines)).await {
            Ok(Ok(lines)) => Ok(lines),
            Ok(Err(e)) => Err(HealthError::log_unavailable(format!(
                "{}: {e}",
                self.path.display()
            ))),
            Err(_) => Err(HealthError::log_unavailable(format!(
                "reading {} timed out",
                self.path.display()
            ))),
        }
    }
}

pub fn source_from_config(cfg: &LogConfig) -> Arc<dyn LogSource> {
    let t = Duration::from_millis(cfg.command_timeout_ms);
    match (cfg.source, cfg.file.as_ref()) {
        (LogSourceKind::File, Some(path)) => Arc::new(FileSource::new(path.clone(), t)),
        _ => Arc::new(JournalSource::new(t)),
    }
}
