//! Background monitor behavior against a fake sysfs tree and staged
//! process tables.

mod common;

use common::*;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use llamactl_agent::config::DeviceConfig;
use llamactl_agent::diagnosis::{
    LOG_SCAN_UNAVAILABLE, PROCESS_SCAN_UNAVAILABLE, STUCK_PROCESS, TELEMETRY_UNAVAILABLE,
};
use llamactl_agent::monitor::MonitorState;
use llamactl_agent::process::{ProcEntry, StaticTable};
use llamactl_agent::types::{ProcState, Severity};

const POLL: Duration = Duration::from_millis(40);
const HOUR: Duration = Duration::from_secs(3600);

fn server(pid: u32, state: ProcState) -> ProcEntry {
    ProcEntry::new(pid, "llama-server", state)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_poll_replaces_the_initial_snapshot() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_card(sysfs.path(), "card1", 65_000);
    let table = Arc::new(StaticTable::new(vec![server(100, ProcState::Sleeping)]));
    let m = monitor(
        sysfs.path(),
        table,
        Arc::new(StaticLogs(vec![])),
        settings(vec![DeviceConfig::new("card1", "RX 470")], POLL, HOUR),
    );

    let initial = m.get_snapshot();
    assert!(initial.is_initial());
    assert_eq!(initial.devices.len(), 1);
    assert!(initial.devices[0].read_error.is_none());
    assert_eq!(m.state(), MonitorState::Stopped);

    m.start();
    assert_eq!(m.state(), MonitorState::Running);
    let snap = wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    assert_eq!(snap.devices[0].temperature_celsius, Some(65.0));
    assert_eq!(snap.processes.len(), 1);
    assert_eq!(snap.diagnosis.severity, Severity::Ok);
    assert!(snap.diagnosis.findings.is_empty());
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_stuck_process_is_diagnosed_before_the_schedule() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_card(sysfs.path(), "card1", 60_000);
    let table = Arc::new(StaticTable::new(vec![server(100, ProcState::Running)]));
    let m = monitor(
        sysfs.path(),
        table.clone(),
        Arc::new(StaticLogs(vec![])),
        settings(vec![DeviceConfig::new("card1", "RX 470")], POLL, HOUR),
    );
    m.start();
    wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;

    table.set(vec![server(100, ProcState::UninterruptibleSleep)]);
    let snap = wait_for(&m, Duration::from_secs(3), |s| {
        s.diagnosis.severity == Severity::Critical
    })
    .await;
    assert!(snap.diagnosis.has_code(STUCK_PROCESS));
    assert_eq!(snap.diagnosis.count(Severity::Critical), 1);

    // and back to ok once it is gone
    table.set(vec![]);
    wait_for(&m, Duration::from_secs(3), |s| s.diagnosis.severity == Severity::Ok).await;
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_device_and_log_source_are_warnings() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_card(sysfs.path(), "card1", 50_000);
    let m = monitor(
        sysfs.path(),
        Arc::new(StaticTable::default()),
        Arc::new(BrokenLogs),
        settings(
            vec![
                DeviceConfig::new("card1", "RX 470"),
                DeviceConfig::new("card2", "RX 6600"),
            ],
            POLL,
            HOUR,
        ),
    );
    m.start();
    let snap = wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    m.stop().await;

    assert_eq!(snap.devices[0].temperature_celsius, Some(50.0));
    assert!(snap.devices[0].read_error.is_none());
    assert!(snap.devices[1].read_error.is_some());
    assert_eq!(snap.diagnosis.severity, Severity::Warning);
    assert!(snap.diagnosis.has_code(TELEMETRY_UNAVAILABLE));
    assert!(snap.diagnosis.has_code(LOG_SCAN_UNAVAILABLE));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_snapshot_does_not_wait_on_a_slow_scan() {
    let sysfs = tempfile::tempdir().unwrap();
    let slow = Arc::new(SlowTable {
        inner: Arc::new(StaticTable::new(vec![server(1, ProcState::Sleeping)])),
        delay: Duration::from_millis(300),
    });
    let m = monitor(
        sysfs.path(),
        slow,
        Arc::new(StaticLogs(vec![])),
        settings(vec![], Duration::from_millis(10), HOUR),
    );
    m.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let t0 = Instant::now();
    for _ in 0..1000 {
        let _ = m.get_snapshot();
    }
    assert!(t0.elapsed() < Duration::from_millis(100), "took {:?}", t0.elapsed());
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_freezes_the_cache() {
    let sysfs = tempfile::tempdir().unwrap();
    fake_card(sysfs.path(), "card1", 40_000);
    let m = monitor(
        sysfs.path(),
        Arc::new(StaticTable::new(vec![server(5, ProcState::Sleeping)])),
        Arc::new(StaticLogs(vec![])),
        settings(vec![DeviceConfig::new("card1", "RX 470")], POLL, HOUR),
    );
    m.start();
    m.start(); // no-op
    wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    m.stop().await;
    assert_eq!(m.state(), MonitorState::Stopped);

    let before = m.get_snapshot();
    tokio::time::sleep(POLL * 5).await;
    let after = m.get_snapshot();
    assert!(Arc::ptr_eq(&before, &after));

    // stopping twice is harmless
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_cycle_keeps_previous_snapshot_and_recovers() {
    let sysfs = tempfile::tempdir().unwrap();
    let flaky = Arc::new(FlakyTable {
        inner: Arc::new(StaticTable::new(vec![server(9, ProcState::Running)])),
        failures: 3,
        calls: AtomicUsize::new(0),
    });
    let m = monitor(
        sysfs.path(),
        flaky,
        Arc::new(StaticLogs(vec![])),
        settings(vec![], POLL, HOUR),
    );
    m.start();
    let snap = wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    assert_eq!(m.state(), MonitorState::Running);
    assert_eq!(snap.processes.len(), 1);
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn updated_at_never_goes_backwards() {
    let sysfs = tempfile::tempdir().unwrap();
    let m = monitor(
        sysfs.path(),
        Arc::new(StaticTable::default()),
        Arc::new(StaticLogs(vec![])),
        settings(vec![], Duration::from_millis(10), HOUR),
    );
    let mut rx = m.subscribe();
    m.start();

    let mut last = m.get_snapshot().updated_at;
    for _ in 0..10 {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("snapshot published")
            .unwrap();
        let now = rx.borrow_and_update().updated_at;
        assert!(now >= last);
        last = now;
    }
    m.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_diagnosis_is_fresh_and_leaves_the_cache_alone() {
    let sysfs = tempfile::tempdir().unwrap();
    let table = Arc::new(StaticTable::new(vec![server(
        101,
        ProcState::UninterruptibleSleep,
    )]));
    let m = monitor(
        sysfs.path(),
        table,
        Arc::new(StaticLogs(vec![
            "amdgpu 0000:03:00.0: [gfxhub] page fault (src_id:0 ring:24)".into(),
        ])),
        settings(vec![DeviceConfig::new("card1", "RX 470")], POLL, HOUR),
    );

    let d = m.request_diagnosis_now().await;
    assert_eq!(d.severity, Severity::Critical);
    assert_eq!(d.count(Severity::Critical), 1);
    // card1 is absent from the fake sysfs tree
    assert!(d.has_code(TELEMETRY_UNAVAILABLE));
    assert!(d.has_code("log:gpu-page-fault"));
    assert!(m.get_snapshot().is_initial());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_diagnosis_reports_an_unreadable_process_table() {
    let sysfs = tempfile::tempdir().unwrap();
    let broken = Arc::new(FlakyTable {
        inner: Arc::new(StaticTable::default()),
        failures: 100,
        calls: AtomicUsize::new(0),
    });
    let m = monitor(
        sysfs.path(),
        broken,
        Arc::new(StaticLogs(vec![])),
        settings(vec![], POLL, HOUR),
    );

    let d = m.request_diagnosis_now().await;
    assert_eq!(d.severity, Severity::Warning);
    assert!(d.has_code(PROCESS_SCAN_UNAVAILABLE));
    assert!(!d.findings.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduled_diagnosis_reruns_with_unchanged_signals() {
    let sysfs = tempfile::tempdir().unwrap();
    let logs = Arc::new(SwitchLogs::default());
    let m = monitor(
        sysfs.path(),
        Arc::new(StaticTable::default()),
        logs.clone(),
        settings(vec![], Duration::from_millis(30), Duration::from_millis(150)),
    );
    m.start();
    let first = wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    assert_eq!(first.diagnosis.severity, Severity::Ok);

    // Only the log changes; no stuck pid or device error to trigger early.
    logs.set(&["[drm:amdgpu_job_timedout] *ERROR* ring gfx timeout, signaled seq=41"]);
    let snap = wait_for(&m, Duration::from_secs(3), |s| {
        s.diagnosis.severity == Severity::Warning
    })
    .await;
    m.stop().await;

    assert!(snap.diagnosis.has_code("log:ring-timeout"));
    assert!(snap.diagnosis.generated_at > first.diagnosis.generated_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diagnosis_is_carried_forward_until_due() {
    let sysfs = tempfile::tempdir().unwrap();
    let logs = Arc::new(SwitchLogs::default());
    let m = monitor(
        sysfs.path(),
        Arc::new(StaticTable::new(vec![server(100, ProcState::Sleeping)])),
        logs.clone(),
        settings(vec![], Duration::from_millis(10), HOUR),
    );
    let mut rx = m.subscribe();
    m.start();
    let first = wait_for(&m, Duration::from_secs(3), |s| !s.is_initial()).await;
    let generated = first.diagnosis.generated_at;

    // A new log error alone is not a trigger; it waits for the schedule.
    logs.set(&["amdgpu 0000:03:00.0: GPU reset begin!"]);
    rx.borrow_and_update();
    for _ in 0..5 {
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .expect("snapshot published")
            .unwrap();
    }
    let later = m.get_snapshot();
    m.stop().await;

    assert!(later.updated_at > first.updated_at);
    assert_eq!(later.diagnosis.generated_at, generated);
    assert_eq!(later.diagnosis.severity, Severity::Ok);
    assert!(later.diagnosis.findings.is_empty());
}
