//! Diagnosis engine: correlates stuck processes, unreadable GPU telemetry and
//! kernel log errors into one severity-ranked verdict.
//!
//! `diagnose` is pure. Every check always runs so findings accumulate; the
//! overall severity is the maximum over all findings.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};

use crate::config::LogPatternConfig;
use crate::error::{HealthError, Result};
use crate::logs::LogLines;
use crate::process::is_stuck;
use crate::types::{DeviceSample, Diagnosis, Finding, ProcessRecord, Severity};

pub const STUCK_PROCESS: &str = "stuck-process";
pub const TELEMETRY_UNAVAILABLE: &str = "device-telemetry-unavailable";
pub const LOG_SCAN_UNAVAILABLE: &str = "log-scan-unavailable";
pub const PROCESS_SCAN_UNAVAILABLE: &str = "process-scan-unavailable";
pub const LOG_MATCH_PREFIX: &str = "log:";

/// Built-in kernel driver fault signatures (code, case-insensitive regex).
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    ("gpu-page-fault", r"page[ _-]?fault"),
    ("ring-timeout", r"ring \S+ timeout|ring[ _-]?timeout"),
    ("gpu-reset", r"gpu (soft |hard |mode\d )?reset|gpu recovery"),
    ("amdgpu-error", r"amdgpu.*\b(error|failed)\b"),
    ("vram-alloc-failure", r"(vram|memory).*alloc\w*.*fail"),
    (
        "hung-task",
        r"blocked for more than \d+ seconds|uninterruptible|\bD state\b",
    ),
];

#[derive(Debug, Clone)]
pub struct LogPattern {
    pub code: String,
    regex: Regex,
}

impl LogPattern {
    pub fn new(code: impl Into<String>, pattern: &str) -> Result<Self> {
        let code = code.into();
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| HealthError::config(format!("log pattern {code}: {e}")))?;
        Ok(Self { code, regex })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Ordered pattern set; order determines finding order.
#[derive(Debug, Clone)]
pub struct LogPatterns(Vec<LogPattern>);

impl LogPatterns {
    pub fn builtin() -> Self {
        Self(
            BUILTIN_PATTERNS
                .iter()
                .filter_map(|(code, re)| LogPattern::new(*code, re).ok())
                .collect(),
        )
    }

    /// Configured patterns replace the built-ins when present.
    pub fn from_config(cfg: Option<&[LogPatternConfig]>) -> Result<Self> {
        match cfg {
            None => Ok(Self::builtin()),
            Some(list) => list
                .iter()
                .map(|p| LogPattern::new(p.code.clone(), &p.pattern))
                .collect::<Result<Vec<_>>>()
                .map(Self),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogPattern> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for LogPatterns {
    fn default() -> Self {
        Self::builtin()
    }
}

pub fn diagnose(
    devices: &[DeviceSample],
    processes: &[ProcessRecord],
    logs: &LogLines,
    patterns: &LogPatterns,
) -> Diagnosis {
    diagnose_at(devices, processes, logs, patterns, Utc::now())
}

pub fn diagnose_at(
    devices: &[DeviceSample],
    processes: &[ProcessRecord],
    logs: &LogLines,
    patterns: &LogPatterns,
    at: DateTime<Utc>,
) -> Diagnosis {
    let mut findings = Vec::new();

    // A D-state GPU process has no soft recovery path.
    for p in processes.iter().filter(|p| is_stuck(p)) {
        findings.push(Finding {
            severity: Severity::Critical,
            code: STUCK_PROCESS.into(),
            message: format!(
                "process {} ({}) is stuck in uninterruptible sleep",
                p.pid, p.command_name
            ),
            evidence: format!("pid={} command={}", p.pid, p.command_name),
        });
    }

    // Degraded monitoring path, not proof of a hang.
    for d in devices {
        if let Some(err) = &d.read_error {
            findings.push(Finding {
                severity: Severity::Warning,
                code: TELEMETRY_UNAVAILABLE.into(),
                message: format!("telemetry unavailable for {} ({})", d.display_name, d.device_id),
                evidence: format!("{}: {}", d.device_id, err),
            });
        }
    }

    match logs {
        LogLines::Available(lines) => {
            for pat in patterns.iter() {
                let mut hits = lines.iter().filter(|l| pat.is_match(l));
                if let Some(latest) = hits.next() {
                    let count = 1 + hits.count();
                    findings.push(Finding {
                        severity: Severity::Warning,
                        code: format!("{LOG_MATCH_PREFIX}{}", pat.code),
                        message: format!(
                            "kernel log reports {} ({count} matching line{})",
                            pat.code,
                            if count == 1 { "" } else { "s" }
                        ),
                        evidence: latest.clone(),
                    });
                }
            }
        }
        LogLines::Unavailable(reason) => findings.push(Finding {
            severity: Severity::Warning,
            code: LOG_SCAN_UNAVAILABLE.into(),
            message: "kernel log could not be scanned".into(),
            evidence: reason.clone(),
        }),
    }

    let severity = findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Ok);

    Diagnosis {
        severity,
        findings,
        generated_at: at,
    }
}

/// Record that the process table could not be read. Without it an empty
/// process list would read as "nothing stuck".
pub fn note_process_scan_failure(diagnosis: &mut Diagnosis, reason: &str) {
    diagnosis.findings.insert(
        0,
        Finding {
            severity: Severity::Warning,
            code: PROCESS_SCAN_UNAVAILABLE.into(),
            message: "process table could not be scanned; stuck processes may be missed".into(),
            evidence: reason.into(),
        },
    );
    diagnosis.severity = diagnosis.severity.max(Severity::Warning);
}
