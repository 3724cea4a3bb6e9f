//! Stop verification. After the server has been signalled, confirm that none
//! of its processes are left in uninterruptible sleep. Such processes cannot
//! be killed by any signal, so this only detects and reports.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::process::{is_stuck, scan_blocking, ProcessScanner};
use crate::types::ProcessRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum StopVerdict {
    Clean,
    /// Hard reset required; these PIDs will not exit.
    StuckProcessesRemain(Vec<ProcessRecord>),
    /// The process table could not be read, so survivors are unknown.
    Unverified(String),
}

impl StopVerdict {
    pub fn is_clean(&self) -> bool {
        matches!(self, StopVerdict::Clean)
    }

    /// A clean result that rests on an incomplete PID set is not clean.
    pub fn unless_incomplete(self, gap: Option<String>) -> StopVerdict {
        match (self, gap) {
            (StopVerdict::Clean, Some(reason)) => StopVerdict::Unverified(reason),
            (v, _) => v,
        }
    }
}

#[derive(Clone)]
pub struct LifecycleGuard {
    scanner: ProcessScanner,
}

impl LifecycleGuard {
    pub fn new(scanner: ProcessScanner) -> Self {
        Self { scanner }
    }

    pub async fn verify_clean_stop(&self, known_pids: &[u32], grace_period: Duration) -> StopVerdict {
        let roots: BTreeSet<u32> = known_pids.iter().copied().collect();
        if roots.is_empty() {
            return StopVerdict::Clean;
        }

        // Capture descendants now: once a parent exits its children are
        // reparented and no longer traceable to it.
        let scanner = self.scanner.clone();
        let set = roots.clone();
        let (tracked, gap) = match scan_blocking(move || scanner.descendants(&set)).await {
            Ok(t) => (t, None),
            Err(e) => {
                warn!("descendant scan failed, tracking known pids only: {e}");
                (roots, Some(format!("descendants not captured: {e}")))
            }
        };

        tokio::time::sleep(grace_period).await;

        let scanner = self.scanner.clone();
        let set = tracked.clone();
        let remaining = match scan_blocking(move || scanner.scan_tree(&set)).await {
            Ok(r) => r,
            Err(e) => {
                error!("post-stop process scan failed; stop is unverified: {e}");
                return StopVerdict::Unverified(e.to_string());
            }
        };

        let (stuck, alive): (Vec<_>, Vec<_>) = remaining.into_iter().partition(is_stuck);
        if !alive.is_empty() {
            let pids: Vec<u32> = alive.iter().map(|p| p.pid).collect();
            warn!("processes still alive after {grace_period:?} (not stuck): {pids:?}");
        }
        if stuck.is_empty() {
            if gap.is_none() {
                info!("server stopped cleanly ({} pid(s) tracked)", tracked.len());
            }
            StopVerdict::Clean.unless_incomplete(gap)
        } else {
            let pids: Vec<u32> = stuck.iter().map(|p| p.pid).collect();
            error!(
                "{} process(es) stuck in uninterruptible sleep after stop: {pids:?}; hard reset required",
                stuck.len()
            );
            StopVerdict::StuckProcessesRemain(stuck)
        }
    }
}
