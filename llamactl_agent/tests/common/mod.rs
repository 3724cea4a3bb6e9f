//! Shared fixtures: a fake sysfs tree, scripted log sources and process
//! tables with controllable behavior.
#![allow(dead_code)]

use async_trait::async_trait;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llamactl_agent::config::DeviceConfig;
use llamactl_agent::device::DeviceReader;
use llamactl_agent::diagnosis::LogPatterns;
use llamactl_agent::error::{HealthError, Result};
use llamactl_agent::logs::{LogSource, LogWindow};
use llamactl_agent::monitor::{HealthMonitor, MonitorSettings};
use llamactl_agent::process::{ProcEntry, ProcessFilter, ProcessScanner, ProcessTable, StaticTable};
use llamactl_agent::types::HealthSnapshot;

pub fn write(root: &Path, rel: &str, contents: &str) {
    let p = root.join(rel);
    fs::create_dir_all(p.parent().unwrap()).unwrap();
    fs::write(p, contents).unwrap();
}

/// card with temperature, utilization and power readable
pub fn fake_card(root: &Path, id: &str, milli_c: u32) {
    let dev = format!("class/drm/{id}/device");
    write(root, &format!("{dev}/hwmon/hwmon0/temp1_input"), &format!("{milli_c}\n"));
    write(root, &format!("{dev}/hwmon/hwmon0/power1_average"), "50000000\n");
    write(root, &format!("{dev}/gpu_busy_percent"), "30\n");
}

pub struct StaticLogs(pub Vec<String>);

#[async_trait]
impl LogSource for StaticLogs {
    async fn recent_lines(&self, _window: &LogWindow) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

pub struct BrokenLogs;

#[async_trait]
impl LogSource for BrokenLogs {
    async fn recent_lines(&self, _window: &LogWindow) -> Result<Vec<String>> {
        Err(HealthError::log_unavailable("journalctl: not found"))
    }
}

/// Log lines that a test can swap while the monitor runs.
#[derive(Default)]
pub struct SwitchLogs {
    lines: Mutex<Vec<String>>,
}

impl SwitchLogs {
    pub fn set(&self, lines: &[&str]) {
        *self.lines.lock().unwrap() = lines.iter().map(|l| l.to_string()).collect();
    }
}

#[async_trait]
impl LogSource for SwitchLogs {
    async fn recent_lines(&self, _window: &LogWindow) -> Result<Vec<String>> {
        Ok(self.lines.lock().unwrap().clone())
    }
}

/// Delegates to a static table after sleeping, like a slow /proc walk.
pub struct SlowTable {
    pub inner: Arc<StaticTable>,
    pub delay: Duration,
}

impl ProcessTable for SlowTable {
    fn entries(&self) -> Result<Vec<ProcEntry>> {
        std::thread::sleep(self.delay);
        self.inner.entries()
    }
}

/// Panics on the first `failures` calls, then behaves like `inner`.
pub struct FlakyTable {
    pub inner: Arc<StaticTable>,
    pub failures: usize,
    pub calls: AtomicUsize,
}

impl ProcessTable for FlakyTable {
    fn entries(&self) -> Result<Vec<ProcEntry>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            panic!("simulated process table failure #{n}");
        }
        self.inner.entries()
    }
}

pub fn settings(devices: Vec<DeviceConfig>, poll: Duration, diagnosis: Duration) -> MonitorSettings {
    MonitorSettings {
        devices,
        poll_interval: poll,
        diagnosis_interval: diagnosis,
        log_window: LogWindow {
            since: Duration::from_secs(600),
            max_lines: 100,
        },
        process_filter: ProcessFilter::name("llama-server"),
    }
}

pub fn monitor(
    sysfs: &Path,
    table: Arc<dyn ProcessTable>,
    logs: Arc<dyn LogSource>,
    settings: MonitorSettings,
) -> HealthMonitor {
    HealthMonitor::new(
        settings,
        DeviceReader::new(sysfs, Duration::from_millis(200)),
        ProcessScanner::new(table),
        logs,
        LogPatterns::builtin(),
    )
}

/// Poll `get_snapshot` until `pred` holds or `limit` passes.
pub async fn wait_for<F>(m: &HealthMonitor, limit: Duration, pred: F) -> Arc<HealthSnapshot>
where
    F: Fn(&HealthSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let snap = m.get_snapshot();
        if pred(&snap) {
            return snap;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {limit:?}; last snapshot: {snap:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
