//! Health data types shared by the monitor and sent to clients as JSON.
//! Field names here are the wire format.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::DeviceConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Ok,
    Warning,
    Critical,
}

/// Core metrics that failed to read for one device in one cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricReadError {
    pub metrics: Vec<&'static str>,
    pub message: String,
}

impl std::fmt::Display for MetricReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSample {
    pub device_id: String,
    pub display_name: String,
    pub temperature_celsius: Option<f32>,
    pub utilization_percent: Option<f32>,
    pub power_watts: Option<f32>,
    // supplemental, never set read_error
    pub gpu_clock_mhz: Option<u32>,
    pub mem_clock_mhz: Option<u32>,
    pub fan_speed_percent: Option<u32>,
    pub vram_used_bytes: Option<u64>,
    pub vram_total_bytes: Option<u64>,
    pub read_error: Option<MetricReadError>,
}

impl DeviceSample {
    /// Sample with every metric absent and no error recorded.
    pub fn placeholder(device: &DeviceConfig) -> Self {
        Self {
            device_id: device.id.clone(),
            display_name: device.name.clone(),
            temperature_celsius: None,
            utilization_percent: None,
            power_watts: None,
            gpu_clock_mhz: None,
            mem_clock_mhz: None,
            fan_speed_percent: None,
            vram_used_bytes: None,
            vram_total_bytes: None,
            read_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcState {
    Running,
    Sleeping,
    /// "D" state: not killable by signals.
    UninterruptibleSleep,
    Zombie,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub command_name: String,
    pub state: ProcState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub evidence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub severity: Severity,
    pub findings: Vec<Finding>,
    pub generated_at: DateTime<Utc>,
}

impl Diagnosis {
    pub fn all_clear(at: DateTime<Utc>) -> Self {
        Self {
            severity: Severity::Ok,
            findings: Vec::new(),
            generated_at: at,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.findings.iter().any(|f| f.code == code)
    }

    /// Advice shown to the operator next to the verdict.
    pub fn recommendation(&self) -> &'static str {
        let stuck = self.has_code(crate::diagnosis::STUCK_PROCESS);
        let telemetry = self.has_code(crate::diagnosis::TELEMETRY_UNAVAILABLE);
        let logs = self
            .findings
            .iter()
            .any(|f| f.code.starts_with(crate::diagnosis::LOG_MATCH_PREFIX));
        if stuck {
            "Processes are stuck in uninterruptible sleep and cannot be killed. \
             The GPU has likely hung; a hard system reset is required."
        } else if telemetry && logs {
            "GPU telemetry is unreadable and the kernel log reports GPU errors. \
             The GPU may have crashed; check it and consider a reset."
        } else if telemetry {
            "GPU telemetry paths are unreadable. The GPU may be unstable; \
             monitor closely and consider stopping the model."
        } else if logs {
            "GPU-related errors appear in the kernel log. Monitor GPU stability \
             and consider reducing clocks or offload."
        } else if self.severity > Severity::Ok {
            "Monitoring is degraded; the verdict may be incomplete."
        } else {
            "No issues detected."
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub devices: Vec<DeviceSample>,
    pub processes: Vec<ProcessRecord>,
    pub diagnosis: Diagnosis,
    pub updated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Served before the first poll completes.
    pub fn empty(devices: &[DeviceConfig]) -> Self {
        Self {
            devices: devices.iter().map(DeviceSample::placeholder).collect(),
            processes: Vec::new(),
            diagnosis: Diagnosis::all_clear(DateTime::UNIX_EPOCH),
            updated_at: DateTime::UNIX_EPOCH,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.updated_at == DateTime::UNIX_EPOCH
    }
}
