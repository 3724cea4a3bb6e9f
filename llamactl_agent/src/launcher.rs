//! Supervised server process: start with the persisted launch settings,
//! capture its output, stop it by process group and verify the stop.

use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, ServerConfig};
use crate::error::{HealthError, Result};
use crate::lifecycle::{LifecycleGuard, StopVerdict};
use crate::process::{scan_blocking, ProcessFilter, ProcessScanner};
use crate::settings::LaunchSettings;

pub const LOG_CAPACITY: usize = 1000;
const STARTUP_CHECK: Duration = Duration::from_secs(1);

fn push_capped<T>(dq: &mut VecDeque<T>, v: T, cap: usize) {
    if dq.len() == cap {
        dq.pop_front();
    }
    dq.push_back(v);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    /// Pass back as `since` to get only newer lines.
    pub next: u64,
}

/// Bounded server output. Sequence numbers keep increasing across `clear`
/// so pollers never see a line twice.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    next_seq: u64,
    cap: usize,
}

impl LogBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap),
            next_seq: 0,
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, text: impl Into<String>) {
        let entry = LogEntry {
            seq: self.next_seq,
            text: text.into(),
        };
        self.next_seq += 1;
        push_capped(&mut self.entries, entry, self.cap);
    }

    /// Entries with `seq >= since`, oldest first.
    pub fn since(&self, since: u64) -> LogPage {
        LogPage {
            entries: self
                .entries
                .iter()
                .filter(|e| e.seq >= since)
                .cloned()
                .collect(),
            next: self.next_seq,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub type SharedLogs = Arc<Mutex<LogBuffer>>;

fn stamp(prefix: &str, line: &str) -> String {
    format!("[{}] {prefix}: {line}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

fn append(logs: &SharedLogs, text: String) {
    logs.lock().unwrap_or_else(|e| e.into_inner()).push(text);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    #[serde(flatten)]
    pub verdict: StopVerdict,
    pub message: String,
}

struct RunningServer {
    child: Child,
    pid: u32,
    model: String,
    pumps: Vec<JoinHandle<()>>,
}

fn stop_message(verdict: &StopVerdict, cache_note: &str) -> String {
    match verdict {
        StopVerdict::Clean => format!("Model server stopped{cache_note}."),
        StopVerdict::StuckProcessesRemain(recs) => format!(
            "{} process(es) stuck in uninterruptible sleep and cannot be killed; \
             a hard system reset is required{cache_note}.",
            recs.len()
        ),
        StopVerdict::Unverified(reason) => format!(
            "Stop signal sent but the stop could not be verified ({reason}); \
             check for stuck processes before restarting{cache_note}."
        ),
    }
}

/// Argument vector (without the binary) for one launch.
pub fn build_args(server: &ServerConfig, s: &LaunchSettings, model: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-m".into(),
        server.model_dir.join(model).display().to_string(),
        "--ctx-size".into(),
        s.ctx_size.to_string(),
        "--n-gpu-layers".into(),
        s.ngl.to_string(),
        "--main-gpu".into(),
        s.main_gpu.to_string(),
        "--tensor-split".into(),
        s.tensor_split.clone(),
        "--flash-attn".into(),
        s.flash_attn.clone(),
        "--batch-size".into(),
        s.batch_size.to_string(),
        "--ubatch-size".into(),
        s.ubatch_size.to_string(),
        "--port".into(),
        s.port.to_string(),
        "--host".into(),
        s.host.clone(),
        "--parallel".into(),
        s.parallel.to_string(),
        "--slot-save-path".into(),
        server.slots_dir.display().to_string(),
    ];
    if s.cont_batching {
        args.push("--cont-batching".into());
    }
    args.extend(s.extra_args().map(str::to_owned));
    args
}

/// `*.gguf` file names in `dir`, sorted. A missing dir has no models.
pub fn list_models(dir: &Path) -> Result<Vec<String>> {
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("model dir {} does not exist", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let mut models: Vec<String> = rd
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "gguf"))
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    models.sort();
    Ok(models)
}

fn spawn_pump<R>(reader: R, prefix: &'static str, logs: SharedLogs) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!("server {prefix}: {line}");
                    append(&logs, stamp(prefix, line.trim_end()));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("server {prefix} pipe closed: {e}");
                    break;
                }
            }
        }
    })
}

pub struct ServerLauncher {
    server: ServerConfig,
    grace: Duration,
    startup_check: Duration,
    scanner: ProcessScanner,
    filter: ProcessFilter,
    guard: LifecycleGuard,
    logs: SharedLogs,
    current: Option<RunningServer>,
}

impl ServerLauncher {
    pub fn new(
        server: ServerConfig,
        grace: Duration,
        scanner: ProcessScanner,
        filter: ProcessFilter,
    ) -> Self {
        Self {
            server,
            grace,
            startup_check: STARTUP_CHECK,
            guard: LifecycleGuard::new(scanner.clone()),
            scanner,
            filter,
            logs: Arc::new(Mutex::new(LogBuffer::new(LOG_CAPACITY))),
            current: None,
        }
    }

    pub fn from_config(cfg: &AgentConfig, scanner: ProcessScanner) -> Self {
        Self::new(
            cfg.server.clone(),
            cfg.stop_grace(),
            scanner,
            ProcessFilter::name(cfg.process_name.clone()),
        )
    }

    /// How long `start` waits before checking for an immediate exit.
    pub fn with_startup_check(mut self, d: Duration) -> Self {
        self.startup_check = d;
        self
    }

    pub fn logs(&self) -> SharedLogs {
        self.logs.clone()
    }

    pub fn logs_since(&self, since: u64) -> LogPage {
        self.logs.lock().unwrap_or_else(|e| e.into_inner()).since(since)
    }

    pub fn models(&self) -> Result<Vec<String>> {
        list_models(&self.server.model_dir)
    }

    pub fn model_dir(&self) -> &Path {
        &self.server.model_dir
    }

    /// Current status; notices a server that exited on its own.
    pub fn status(&mut self) -> ServerStatus {
        if let Some(srv) = self.current.as_mut() {
            if let Ok(Some(code)) = srv.child.try_wait() {
                self.on_exit(code);
            }
        }
        match &self.current {
            Some(srv) => ServerStatus {
                running: true,
                pid: Some(srv.pid),
                model: Some(srv.model.clone()),
            },
            None => ServerStatus {
                running: false,
                pid: None,
                model: None,
            },
        }
    }

    fn on_exit(&mut self, code: ExitStatus) {
        if let Some(srv) = self.current.take() {
            warn!("server pid {} exited on its own ({code})", srv.pid);
            append(&self.logs, stamp("AGENT", &format!("server exited ({code})")));
        }
    }

    pub async fn start(&mut self, settings: &LaunchSettings) -> Result<ServerStatus> {
        if self.status().running {
            return Err(HealthError::launch("model is already running"));
        }
        let model = settings
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| HealthError::launch("no model selected"))?;
        if model.contains('/') || model.contains("..") {
            return Err(HealthError::launch(format!("invalid model name {model:?}")));
        }

        let args = build_args(&self.server, settings, model);
        info!("starting {} {}", self.server.binary.display(), args.join(" "));
        {
            let mut logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
            logs.clear();
            logs.push(stamp(
                "AGENT",
                &format!("STARTING MODEL: {model} on {}:{}", settings.host, settings.port),
            ));
        }

        let mut child = Command::new(&self.server.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                let msg = format!("failed to spawn {}: {e}", self.server.binary.display());
                append(&self.logs, stamp("AGENT", &msg));
                HealthError::launch(msg)
            })?;
        let pid = child
            .id()
            .ok_or_else(|| HealthError::launch("server exited before its pid was known"))?;

        let mut pumps = Vec::new();
        if let Some(out) = child.stdout.take() {
            pumps.push(spawn_pump(out, "OUT", self.logs.clone()));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(spawn_pump(err, "ERR", self.logs.clone()));
        }

        tokio::time::sleep(self.startup_check).await;
        if let Some(code) = child.try_wait()? {
            // let the pumps drain what the server printed before dying
            for p in pumps {
                let _ = timeout(Duration::from_millis(500), p).await;
            }
            let msg = format!("process exited immediately with {code}");
            error!("{msg}");
            append(&self.logs, stamp("AGENT", &format!("CRITICAL ERROR: {msg}")));
            return Err(HealthError::launch(msg));
        }

        info!("server started, pid {pid}");
        self.current = Some(RunningServer {
            child,
            pid,
            model: model.to_owned(),
            pumps,
        });
        Ok(self.status())
    }

    /// SIGTERM the server's process group and verify nothing is left stuck.
    /// Other processes matching the supervised name are verified as well.
    pub async fn stop(&mut self) -> StopReport {
        // Any scan failure before the signal leaves the tracked set incomplete.
        let mut gap: Option<String> = None;
        let scanner = self.scanner.clone();
        let filter = self.filter.clone();
        let mut roots: BTreeSet<u32> = match scan_blocking(move || scanner.scan(&filter)).await {
            Ok(recs) => recs.into_iter().map(|r| r.pid).collect(),
            Err(e) => {
                warn!("name scan before stop failed: {e}");
                gap = Some(format!("process name scan failed: {e}"));
                BTreeSet::new()
            }
        };
        let ours = self.current.take();
        if let Some(srv) = &ours {
            roots.insert(srv.pid);
        }
        // Descendants must be captured before the signal; once the
        // parent exits they are reparented.
        let scanner = self.scanner.clone();
        let set = roots.clone();
        let tracked: Vec<u32> = match scan_blocking(move || scanner.descendants(&set)).await {
            Ok(d) => d.into_iter().collect(),
            Err(e) => {
                warn!("descendant scan before stop failed: {e}");
                gap.get_or_insert_with(|| format!("descendants not captured: {e}"));
                roots.into_iter().collect()
            }
        };

        let verdict = match ours {
            Some(mut srv) => {
                info!("stopping server pid {}", srv.pid);
                signal_group(srv.pid);
                let reap = async {
                    match timeout(self.grace, srv.child.wait()).await {
                        Ok(Ok(code)) => debug!("server exited ({code})"),
                        Ok(Err(e)) => warn!("waiting for server: {e}"),
                        Err(_) => warn!("server did not exit within {:?}", self.grace),
                    }
                };
                let (_, verdict) =
                    tokio::join!(reap, self.guard.verify_clean_stop(&tracked, self.grace));
                for p in srv.pumps {
                    p.abort();
                }
                verdict
            }
            None => self.guard.verify_clean_stop(&tracked, Duration::ZERO).await,
        }
        .unless_incomplete(gap);

        let cache_note = self.clear_cache().await;
        let message = stop_message(&verdict, &cache_note);
        append(&self.logs, stamp("AGENT", &message));
        StopReport { verdict, message }
    }

    async fn clear_cache(&self) -> String {
        let dir = &self.server.cache_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!("cleared {}", dir.display());
                " and cache cleared".into()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => " and cache cleared".into(),
            Err(e) => {
                warn!("failed to clear cache {}: {e}", dir.display());
                format!(" (cache not cleared: {e})")
            }
        }
    }
}

fn signal_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGTERM) };
    if rc != 0 {
        warn!(
            "SIGTERM to process group {pgid} failed: {}",
            std::io::Error::last_os_error()
        );
    }
}
