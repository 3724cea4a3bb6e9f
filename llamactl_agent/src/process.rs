//! Process state scanner: finds the supervised server's processes in the OS
//! process table and classifies their scheduling state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

use crate::error::{HealthError, Result};
use crate::types::{ProcState, ProcessRecord};

/// One row of the process table as seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    /// Full command line joined with spaces (may be empty for kernel threads).
    pub cmdline: String,
    pub state: ProcState,
}

impl ProcEntry {
    pub fn new(pid: u32, name: impl Into<String>, state: ProcState) -> Self {
        let name = name.into();
        Self {
            pid,
            parent: None,
            cmdline: name.clone(),
            name,
            state,
        }
    }

    pub fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }
}

/// Source of process table snapshots. Implementations may block briefly;
/// async callers should go through [`scan_blocking`]. An `Err` means the
/// table could not be read, which callers must not treat as "no processes".
pub trait ProcessTable: Send + Sync {
    fn entries(&self) -> Result<Vec<ProcEntry>>;
}

/// Live process table backed by a persistent `sysinfo::System`.
pub struct SysinfoTable {
    sys: Mutex<System>,
}

impl SysinfoTable {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoTable {
    fn entries(&self) -> Result<Vec<ProcEntry>> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        // Exited processes are dropped on refresh (remove_dead = true).
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            sys.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
            );
        }))
        .is_err()
        {
            warn!("sysinfo process refresh panicked");
            return Err(HealthError::scan_failed("sysinfo process refresh panicked"));
        }

        Ok(sys
            .processes()
            .values()
            .filter_map(|p| {
                let pid = p.pid().as_u32();
                if matches!(p.status(), ProcessStatus::Dead) {
                    debug!("{}", HealthError::ProcessScanPartial(pid));
                    return None;
                }
                let cmdline = p
                    .cmd()
                    .iter()
                    .map(|a| a.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                Some(ProcEntry {
                    pid,
                    parent: p.parent().map(|pp| pp.as_u32()),
                    name: p.name().to_string_lossy().into_owned(),
                    cmdline,
                    state: map_status(p.status()),
                })
            })
            .collect())
    }
}

/// In-memory process table; lets callers stage process states explicitly.
#[derive(Default)]
pub struct StaticTable {
    rows: Mutex<Vec<ProcEntry>>,
}

impl StaticTable {
    pub fn new(rows: Vec<ProcEntry>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn set(&self, rows: Vec<ProcEntry>) {
        *self.rows.lock().unwrap_or_else(|e| e.into_inner()) = rows;
    }

    pub fn remove(&self, pid: u32) {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|r| r.pid != pid);
    }
}

impl ProcessTable for StaticTable {
    fn entries(&self) -> Result<Vec<ProcEntry>> {
        Ok(self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

pub fn map_status(status: ProcessStatus) -> ProcState {
    match status {
        ProcessStatus::Run => ProcState::Running,
        ProcessStatus::Sleep | ProcessStatus::Idle => ProcState::Sleeping,
        ProcessStatus::UninterruptibleDiskSleep => ProcState::UninterruptibleSleep,
        ProcessStatus::Zombie => ProcState::Zombie,
        ProcessStatus::Stop | ProcessStatus::Tracing => ProcState::Stopped,
        _ => ProcState::Unknown,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessFilter {
    /// Case-insensitive substring of the command name or full command line.
    NameContains(String),
    Pids(BTreeSet<u32>),
    Any(Vec<ProcessFilter>),
}

impl ProcessFilter {
    pub fn name(pattern: impl Into<String>) -> Self {
        ProcessFilter::NameContains(pattern.into().to_lowercase())
    }

    pub fn pids<I: IntoIterator<Item = u32>>(pids: I) -> Self {
        ProcessFilter::Pids(pids.into_iter().collect())
    }

    pub fn matches(&self, e: &ProcEntry) -> bool {
        match self {
            ProcessFilter::NameContains(pat) => {
                let pat = pat.to_lowercase();
                e.name.to_lowercase().contains(&pat) || e.cmdline.to_lowercase().contains(&pat)
            }
            ProcessFilter::Pids(set) => set.contains(&e.pid),
            ProcessFilter::Any(fs) => fs.iter().any(|f| f.matches(e)),
        }
    }
}

pub fn is_stuck(record: &ProcessRecord) -> bool {
    record.state == ProcState::UninterruptibleSleep
}

/// `roots` plus every transitive child present in `entries`.
pub fn with_descendants(entries: &[ProcEntry], roots: &BTreeSet<u32>) -> BTreeSet<u32> {
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    for e in entries {
        if let Some(parent) = e.parent {
            children.entry(parent).or_default().push(e.pid);
        }
    }
    let mut out = roots.clone();
    let mut stack: Vec<u32> = roots.iter().copied().collect();
    while let Some(pid) = stack.pop() {
        if let Some(kids) = children.get(&pid) {
            for &kid in kids {
                if out.insert(kid) {
                    stack.push(kid);
                }
            }
        }
    }
    out
}

fn to_records<'a, I>(rows: I) -> Vec<ProcessRecord>
where
    I: Iterator<Item = &'a ProcEntry>,
{
    let mut by_pid: BTreeMap<u32, ProcessRecord> = BTreeMap::new();
    for e in rows {
        by_pid.entry(e.pid).or_insert_with(|| ProcessRecord {
            pid: e.pid,
            command_name: e.name.clone(),
            state: e.state,
        });
    }
    // BTreeMap iteration gives ascending PID
    by_pid.into_values().collect()
}

#[derive(Clone)]
pub struct ProcessScanner {
    table: Arc<dyn ProcessTable>,
}

impl ProcessScanner {
    pub fn new(table: Arc<dyn ProcessTable>) -> Self {
        Self { table }
    }

    pub fn live() -> Self {
        Self::new(Arc::new(SysinfoTable::new()))
    }

    /// Matching processes, ascending PID. Blocking.
    pub fn scan(&self, filter: &ProcessFilter) -> Result<Vec<ProcessRecord>> {
        let entries = self.table.entries()?;
        Ok(to_records(entries.iter().filter(|e| filter.matches(e))))
    }

    /// `roots` and their descendants that are still in the table. Blocking.
    pub fn scan_tree(&self, roots: &BTreeSet<u32>) -> Result<Vec<ProcessRecord>> {
        let entries = self.table.entries()?;
        let wanted = with_descendants(&entries, roots);
        Ok(to_records(entries.iter().filter(|e| wanted.contains(&e.pid))))
    }

    /// Current descendant closure of `roots` (roots included). Blocking.
    pub fn descendants(&self, roots: &BTreeSet<u32>) -> Result<BTreeSet<u32>> {
        Ok(with_descendants(&self.table.entries()?, roots))
    }
}

/// Run a blocking scan off the runtime. A panicking table surfaces as
/// `ProcessScanFailed`.
pub async fn scan_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HealthError::scan_failed(format!("scan task: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<StaticTable> {
        Arc::new(StaticTable::new(vec![
            ProcEntry::new(300, "bash", ProcState::Sleeping),
            ProcEntry::new(120, "llama-server", ProcState::UninterruptibleSleep).with_parent(1),
            ProcEntry::new(101, "sh", ProcState::Sleeping)
                .with_cmdline("sh -c /usr/local/bin/llama-server -m model.gguf"),
            ProcEntry::new(121, "llama-worker", ProcState::Running).with_parent(120),
            ProcEntry::new(122, "helper", ProcState::Zombie).with_parent(121),
        ]))
    }

    #[test]
    fn scan_filters_by_name_and_sorts_by_pid() {
        let scanner = ProcessScanner::new(table());
        let recs = scanner.scan(&ProcessFilter::name("LLAMA-SERVER")).unwrap();
        let pids: Vec<u32> = recs.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![101, 120]);
        assert!(!is_stuck(&recs[0]));
        assert!(is_stuck(&recs[1]));
    }

    #[test]
    fn scan_by_pid_set_ignores_absent_pids() {
        let scanner = ProcessScanner::new(table());
        let recs = scanner.scan(&ProcessFilter::pids([121, 999, 300])).unwrap();
        let pids: Vec<u32> = recs.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![121, 300]);
    }

    #[test]
    fn any_filter_combines_without_duplicates() {
        let scanner = ProcessScanner::new(table());
        let f = ProcessFilter::Any(vec![
            ProcessFilter::name("llama"),
            ProcessFilter::pids([120, 122]),
        ]);
        let pids: Vec<u32> = scanner.scan(&f).unwrap().iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![101, 120, 121, 122]);
    }

    #[test]
    fn scan_tree_follows_children() {
        let t = table();
        let scanner = ProcessScanner::new(t.clone());
        let roots: BTreeSet<u32> = [120].into_iter().collect();
        let recs = scanner.scan_tree(&roots).unwrap();
        let pids: Vec<u32> = recs.iter().map(|r| r.pid).collect();
        assert_eq!(pids, vec![120, 121, 122]);
        assert_eq!(recs[2].state, ProcState::Zombie);

        // a vanished process is simply absent
        t.remove(121);
        let pids: Vec<u32> = scanner
            .scan_tree(&roots)
            .unwrap()
            .iter()
            .map(|r| r.pid)
            .collect();
        assert_eq!(pids, vec![120]);
    }

    struct Unreadable;

    impl ProcessTable for Unreadable {
        fn entries(&self) -> Result<Vec<ProcEntry>> {
            Err(HealthError::scan_failed("/proc not mounted"))
        }
    }

    #[test]
    fn unreadable_table_is_an_error_not_an_empty_scan() {
        let scanner = ProcessScanner::new(Arc::new(Unreadable));
        assert!(matches!(
            scanner.scan(&ProcessFilter::name("llama")),
            Err(HealthError::ProcessScanFailed(_))
        ));
        let roots: BTreeSet<u32> = [1].into_iter().collect();
        assert!(scanner.scan_tree(&roots).is_err());
        assert!(scanner.descendants(&roots).is_err());
    }

    #[tokio::test]
    async fn panicking_scan_task_becomes_scan_failed() {
        let r: Result<Vec<ProcessRecord>> = scan_blocking(|| panic!("refresh blew up")).await;
        assert!(matches!(r, Err(HealthError::ProcessScanFailed(_))));
    }

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_status(ProcessStatus::UninterruptibleDiskSleep),
            ProcState::UninterruptibleSleep
        );
        assert_eq!(map_status(ProcessStatus::Run), ProcState::Running);
        assert_eq!(map_status(ProcessStatus::Idle), ProcState::Sleeping);
        assert_eq!(map_status(ProcessStatus::Tracing), ProcState::Stopped);
        assert_eq!(map_status(ProcessStatus::Unknown(42)), ProcState::Unknown);
    }

    #[test]
    fn live_table_sees_this_process() {
        let me = std::process::id();
        let recs = ProcessScanner::live()
            .scan(&ProcessFilter::pids([me]))
            .unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].pid, me);
    }
}
