//! Device reader: samples sysfs-exposed GPU counters for one card.
//!
//! Every file read is bounded by a short timeout. Missing or unreadable core
//! metrics (temperature, utilization, power) are recorded on the sample's
//! `read_error`; the sample itself is always produced. No retries: the next
//! poll cycle simply tries again.

use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::error::HealthError;
use crate::types::{DeviceSample, MetricReadError};

const TEMPERATURE: &str = "temperature";
const UTILIZATION: &str = "utilization";
const POWER: &str = "power";

#[derive(Debug, Clone)]
pub struct DeviceReader {
    sysfs_root: PathBuf,
    per_file_timeout: Duration,
}

impl DeviceReader {
    pub fn new(sysfs_root: impl Into<PathBuf>, per_file_timeout: Duration) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            per_file_timeout,
        }
    }

    fn device_dir(&self, id: &str) -> PathBuf {
        self.sysfs_root
            .join("class")
            .join("drm")
            .join(id)
            .join("device")
    }

    /// Read every configured device concurrently. Order follows `devices`.
    pub async fn read_all(&self, devices: &[DeviceConfig]) -> Vec<DeviceSample> {
        join_all(devices.iter().map(|d| self.read(d))).await
    }

    pub async fn read(&self, device: &DeviceConfig) -> DeviceSample {
        let dir = self.device_dir(&device.id);
        let hwmon = self.hwmon_dir(&dir).await;
        let mut sample = DeviceSample::placeholder(device);
        let mut failed: Vec<(&'static str, String)> = Vec::new();

        match self
            .read_parsed::<f32>(hwmon.as_deref().map(|h| h.join("temp1_input")))
            .await
        {
            Ok(milli_c) => sample.temperature_celsius = Some(milli_c / 1000.0),
            Err(e) => failed.push((TEMPERATURE, e)),
        }
        match self
            .read_parsed::<f32>(Some(dir.join("gpu_busy_percent")))
            .await
        {
            Ok(pct) => sample.utilization_percent = Some(pct),
            Err(e) => failed.push((UTILIZATION, e)),
        }
        match self
            .read_parsed::<f32>(hwmon.as_deref().map(|h| h.join("power1_average")))
            .await
        {
            Ok(micro_w) => sample.power_watts = Some(micro_w / 1_000_000.0),
            Err(e) => failed.push((POWER, e)),
        }

        // Supplemental counters: absent on many cards, never an error.
        sample.gpu_clock_mhz = self
            .read_text(&dir.join("pp_dpm_sclk"))
            .await
            .ok()
            .and_then(|s| parse_active_clock(&s));
        sample.mem_clock_mhz = self
            .read_text(&dir.join("pp_dpm_mclk"))
            .await
            .ok()
            .and_then(|s| parse_active_clock(&s));
        if let Some(h) = hwmon.as_deref() {
            let input = self.read_parsed::<u64>(Some(h.join("fan1_input"))).await;
            let max = self.read_parsed::<u64>(Some(h.join("fan1_max"))).await;
            if let (Ok(input), Ok(max)) = (input, max) {
                if max > 0 {
                    sample.fan_speed_percent = Some((input.saturating_mul(100) / max) as u32);
                }
            }
        }
        let used = self
            .read_parsed::<u64>(Some(dir.join("mem_info_vram_used")))
            .await;
        let total = self
            .read_parsed::<u64>(Some(dir.join("mem_info_vram_total")))
            .await;
        if let (Ok(used), Ok(total)) = (used, total) {
            if total > 0 {
                sample.vram_used_bytes = Some(used);
                sample.vram_total_bytes = Some(total);
            }
        }

        if !failed.is_empty() {
            for (metric, reason) in &failed {
                let err = HealthError::MetricUnavailable {
                    device: device.id.clone(),
                    metric: *metric,
                    reason: reason.clone(),
                };
                debug!("{err}");
            }
            let message = failed
                .iter()
                .map(|(m, r)| format!("{m}: {r}"))
                .collect::<Vec<_>>()
                .join("; ");
            sample.read_error = Some(MetricReadError {
                metrics: failed.iter().map(|(m, _)| *m).collect(),
                message,
            });
        }
        sample
    }

    /// First `hwmon/hwmonN` directory under the device, in name order.
    async fn hwmon_dir(&self, device_dir: &Path) -> Option<PathBuf> {
        let base = device_dir.join("hwmon");
        let listing = timeout(self.per_file_timeout, async {
            let mut rd = tokio::fs::read_dir(&base).await.ok()?;
            let mut dirs = Vec::new();
            while let Ok(Some(entry)) = rd.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with("hwmon") {
                    dirs.push(entry.path());
                }
            }
            dirs.sort();
            dirs.into_iter().next()
        })
        .await;
        listing.ok().flatten()
    }

    async fn read_text(&self, path: &Path) -> Result<String, String> {
        match timeout(self.per_file_timeout, tokio::fs::read_to_string(path)).await {
            Ok(Ok(s)) => Ok(s),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(format!("{} not found", path.display()))
            }
            Ok(Err(e)) => Err(format!("{}: {e}", path.display())),
            Err(_) => Err(format!(
                "{} timed out after {:?}",
                path.display(),
                self.per_file_timeout
            )),
        }
    }

    async fn read_parsed<T: std::str::FromStr>(&self, path: Option<PathBuf>) -> Result<T, String> {
        let path = path.ok_or_else(|| "no hwmon directory".to_string())?;
        let text = self.read_text(&path).await?;
        text.trim()
            .parse::<T>()
            .map_err(|_| format!("{}: unparsable value {:?}", path.display(), text.trim()))
    }
}

/// Parse the active (`*`-marked) level of a `pp_dpm_*` table, e.g. `1: 1100Mhz *`.
pub fn parse_active_clock(table: &str) -> Option<u32> {
    let line = table.lines().find(|l| l.contains('*'))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for (i, tok) in tokens.iter().enumerate() {
        let lower = tok.to_ascii_lowercase();
        if let Some(num) = lower.strip_suffix("mhz") {
            if num.is_empty() {
                // "1100 Mhz"
                return i.checked_sub(1).and_then(|p| tokens[p].parse().ok());
            }
            return num.parse().ok();
        }
    }
    None
}
