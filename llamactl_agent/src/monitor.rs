//! Background health monitor: periodically samples devices and the process
//! table, runs the (heavier) diagnosis on a slower schedule, and publishes an
//! immutable snapshot so readers never wait on live I/O.
//!
//! The snapshot lives in a single-slot `watch` channel. Publishing swaps an
//! `Arc`; all collection happens before that, outside the channel's lock.

use futures::FutureExt;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, DeviceConfig};
use crate::device::DeviceReader;
use crate::diagnosis::{diagnose, note_process_scan_failure, LogPatterns};
use crate::error::{HealthError, Result};
use crate::logs::{self, LogSource, LogWindow};
use crate::process::{is_stuck, scan_blocking, ProcessFilter, ProcessScanner};
use crate::types::{DeviceSample, Diagnosis, HealthSnapshot, ProcessRecord, Severity};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub devices: Vec<DeviceConfig>,
    pub poll_interval: Duration,
    /// Minimum spacing between scheduled diagnoses.
    pub diagnosis_interval: Duration,
    pub log_window: LogWindow,
    pub process_filter: ProcessFilter,
}

impl MonitorSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            devices: cfg.devices.clone(),
            poll_interval: cfg.poll_interval(),
            diagnosis_interval: cfg.diagnosis_interval(),
            log_window: LogWindow::from_config(&cfg.log),
            process_filter: ProcessFilter::name(cfg.process_name.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Running,
}

/// The cheap signals; a change in either triggers an early diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Signals {
    stuck_pids: BTreeSet<u32>,
    erroring_devices: BTreeSet<String>,
}

impl Signals {
    fn of(devices: &[DeviceSample], processes: &[ProcessRecord]) -> Self {
        Self {
            stuck_pids: processes
                .iter()
                .filter(|p| is_stuck(p))
                .map(|p| p.pid)
                .collect(),
            erroring_devices: devices
                .iter()
                .filter(|d| d.read_error.is_some())
                .map(|d| d.device_id.clone())
                .collect(),
        }
    }
}

#[derive(Default)]
struct CycleState {
    last_diagnosis: Option<(Instant, Signals)>,
}

struct Inner {
    settings: MonitorSettings,
    reader: DeviceReader,
    scanner: ProcessScanner,
    logs: Arc<dyn LogSource>,
    patterns: LogPatterns,
    snapshot: watch::Sender<Arc<HealthSnapshot>>,
}

struct Running {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

pub struct HealthMonitor {
    inner: Arc<Inner>,
    task: Mutex<Option<Running>>,
}

impl HealthMonitor {
    pub fn new(
        settings: MonitorSettings,
        reader: DeviceReader,
        scanner: ProcessScanner,
        logs: Arc<dyn LogSource>,
        patterns: LogPatterns,
    ) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(HealthSnapshot::empty(&settings.devices)));
        Self {
            inner: Arc::new(Inner {
                settings,
                reader,
                scanner,
                logs,
                patterns,
                snapshot,
            }),
            task: Mutex::new(None),
        }
    }

    /// Live monitor wired to sysfs, the OS process table and the configured log source.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self> {
        let patterns = LogPatterns::from_config(cfg.log_patterns.as_deref())?;
        Ok(Self::new(
            MonitorSettings::from_config(cfg),
            DeviceReader::new(&cfg.sysfs_root, cfg.metric_timeout()),
            ProcessScanner::live(),
            logs::source_from_config(&cfg.log),
            patterns,
        ))
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.inner.settings
    }

    pub fn scanner(&self) -> &ProcessScanner {
        &self.inner.scanner
    }

    pub fn state(&self) -> MonitorState {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        match task.as_ref() {
            Some(r) if !r.handle.is_finished() => MonitorState::Running,
            _ => MonitorState::Stopped,
        }
    }

    /// Spawn the poll loop. No-op when already running. Must be called
    /// from within a tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(poll_loop(self.inner.clone(), shutdown.clone()));
        info!(
            "health monitor started (poll {:?}, diagnosis every {:?})",
            self.inner.settings.poll_interval, self.inner.settings.diagnosis_interval
        );
        *task = Some(Running { shutdown, handle });
    }

    /// Stop the poll loop and wait for it to exit. Once this returns the
    /// cached snapshot no longer changes.
    pub async fn stop(&self) {
        let running = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Running { shutdown, mut handle }) = running else {
            return;
        };
        shutdown.notify_one();
        if timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!("health monitor did not stop within {STOP_TIMEOUT:?}; aborting");
            handle.abort();
            let _ = handle.await;
        }
        info!("health monitor stopped");
    }

    /// Latest snapshot. Never performs I/O and never waits on the poller.
    pub fn get_snapshot(&self) -> Arc<HealthSnapshot> {
        self.inner.snapshot.borrow().clone()
    }

    /// Change notifications for snapshot consumers; the WebSocket push
    /// subscribes here.
    pub fn subscribe(&self) -> watch::Receiver<Arc<HealthSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Fresh diagnosis, bypassing the cache. Blocks for one device read,
    /// process scan and log read; meant for explicit operator requests only.
    /// The cached snapshot is left untouched.
    pub async fn request_diagnosis_now(&self) -> Diagnosis {
        let inner = &self.inner;
        let devices = inner.reader.read_all(&inner.settings.devices).await;
        let (processes, scan_error) = match inner.scan_processes().await {
            Ok(p) => (p, None),
            Err(e) => {
                warn!("manual diagnosis: {e}");
                (Vec::new(), Some(e.to_string()))
            }
        };
        let lines = logs::collect(inner.logs.as_ref(), &inner.settings.log_window).await;
        let mut diagnosis = diagnose(&devices, &processes, &lines, &inner.patterns);
        if let Some(reason) = scan_error {
            note_process_scan_failure(&mut diagnosis, &reason);
        }
        diagnosis
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = task.take() {
            r.handle.abort();
        }
    }
}

impl Inner {
    async fn scan_processes(&self) -> Result<Vec<ProcessRecord>> {
        let scanner = self.scanner.clone();
        let filter = self.settings.process_filter.clone();
        scan_blocking(move || scanner.scan(&filter)).await
    }

    async fn run_cycle(&self, state: &mut CycleState) -> Result<HealthSnapshot> {
        let devices = self.reader.read_all(&self.settings.devices).await;
        let processes = self.scan_processes().await?;
        let signals = Signals::of(&devices, &processes);
        let previous = self.snapshot.borrow().clone();

        let due = match &state.last_diagnosis {
            None => true,
            Some((at, last)) => {
                at.elapsed() >= self.settings.diagnosis_interval || *last != signals
            }
        };
        let diagnosis = if due {
            let lines = logs::collect(self.logs.as_ref(), &self.settings.log_window).await;
            let d = diagnose(&devices, &processes, &lines, &self.patterns);
            if d.severity != previous.diagnosis.severity {
                match d.severity {
                    Severity::Critical => warn!("health now CRITICAL: {}", d.recommendation()),
                    Severity::Warning => warn!("health degraded: {}", d.recommendation()),
                    Severity::Ok => info!("health back to ok"),
                }
            }
            state.last_diagnosis = Some((Instant::now(), signals));
            d
        } else {
            previous.diagnosis.clone()
        };

        let now = chrono::Utc::now();
        Ok(HealthSnapshot {
            devices,
            processes,
            diagnosis,
            updated_at: now.max(previous.updated_at),
        })
    }

    fn publish(&self, snapshot: HealthSnapshot) {
        self.snapshot.send_replace(Arc::new(snapshot));
    }
}

async fn poll_loop(inner: Arc<Inner>, shutdown: Arc<Notify>) {
    let mut ticker = interval(inner.settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycle = CycleState::default();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                let outcome = AssertUnwindSafe(inner.run_cycle(&mut cycle))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(HealthError::poll_cycle("collection panicked")));
                match outcome {
                    Ok(snapshot) => {
                        debug!("snapshot updated ({} devices, {} processes)",
                            snapshot.devices.len(), snapshot.processes.len());
                        inner.publish(snapshot);
                    }
                    Err(e) => warn!("{e}; serving previous snapshot"),
                }
            }
        }
    }
}
