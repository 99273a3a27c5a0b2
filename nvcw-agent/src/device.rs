//! GPU device snapshots
//!
//! Provides the device reader on top of a `HardwareSource`:
//! - Device enumeration (`count_devices`)
//! - Single device snapshot with its own session
//! - Whole-machine snapshot sharing one session, strict or partial

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::DeviceError;
use crate::hardware::{HardwareSession, HardwareSource, RawDeviceReading};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const MW_PER_W: f64 = 1000.0;

/// One consistent set of readings for a single device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub index: u32,
    pub name: String,
    pub fan_speed_pct: u32,
    pub temperature_c: f64,
    pub performance_state: u32,
    pub power_usage_w: f64,
    pub power_limit_w: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
}

impl DeviceSnapshot {
    /// Convert a raw reading to snapshot units, rejecting zero limits
    pub fn from_reading(index: u32, raw: RawDeviceReading) -> Result<Self, DeviceError> {
        let snapshot = Self {
            index,
            name: raw.name,
            fan_speed_pct: raw.fan_speed_pct,
            temperature_c: f64::from(raw.temperature_c),
            performance_state: raw.performance_state,
            power_usage_w: f64::from(raw.power_usage_mw) / MW_PER_W,
            power_limit_w: f64::from(raw.power_limit_mw) / MW_PER_W,
            memory_used_mb: raw.memory_used_bytes as f64 / BYTES_PER_MB,
            memory_total_mb: raw.memory_total_bytes as f64 / BYTES_PER_MB,
        };
        snapshot.memory_percent()?;
        snapshot.power_percent()?;
        Ok(snapshot)
    }

    /// used / total * 100. Values above 100 (sensor noise) pass through.
    pub fn memory_percent(&self) -> Result<f64, DeviceError> {
        percent(self.index, "memory_total", self.memory_used_mb, self.memory_total_mb)
    }

    /// usage / limit * 100
    pub fn power_percent(&self) -> Result<f64, DeviceError> {
        percent(self.index, "power_limit", self.power_usage_w, self.power_limit_w)
    }
}

fn percent(index: u32, field: &'static str, part: f64, whole: f64) -> Result<f64, DeviceError> {
    if whole.is_finite() && whole > 0.0 {
        Ok(part / whole * 100.0)
    } else {
        Err(DeviceError::zero_denominator(index, field))
    }
}

/// What to do when one device of the machine cannot be read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DevicePolicy {
    /// First failing device fails the whole enumeration
    #[default]
    Strict,
    /// Keep readable devices, report the others
    Partial,
}

/// Result of a whole-machine snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotSet {
    pub snapshots: Vec<DeviceSnapshot>,
    /// Only populated under `DevicePolicy::Partial`
    pub failures: Vec<DeviceError>,
}

/// Reads device snapshots from a hardware source
#[derive(Clone)]
pub struct DeviceReader {
    source: Arc<dyn HardwareSource>,
    policy: DevicePolicy,
}

impl DeviceReader {
    pub fn new(source: Arc<dyn HardwareSource>, policy: DevicePolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> DevicePolicy {
        self.policy
    }

    /// Number of GPUs visible to the monitoring interface
    pub fn count_devices(&self) -> Result<u32, DeviceError> {
        let session = self.open()?;
        count(session.as_ref())
    }

    /// `count_devices` on the blocking pool, for callers on the runtime
    pub async fn count_devices_off_runtime(&self) -> Result<u32, DeviceError> {
        let reader = self.clone();
        tokio::task::spawn_blocking(move || reader.count_devices())
            .await
            .map_err(|e| DeviceError::HardwareUnavailable(format!("device count task failed: {}", e)))?
    }

    /// Snapshot one device in its own session
    pub fn snapshot(&self, index: u32) -> Result<DeviceSnapshot, DeviceError> {
        let session = self.open()?;
        read(session.as_ref(), index)
    }

    /// Snapshot every device in index order, sharing one session
    pub fn snapshot_all(&self) -> Result<SnapshotSet, DeviceError> {
        let session = self.open()?;
        let device_count = count(session.as_ref())?;
        debug!(device_count, policy = ?self.policy, "Snapshotting devices");

        let mut set = SnapshotSet::default();
        for index in 0..device_count {
            match read(session.as_ref(), index) {
                Ok(snapshot) => set.snapshots.push(snapshot),
                Err(err) if self.policy == DevicePolicy::Partial => {
                    warn!(index, error = %err, "Skipping unreadable device");
                    set.failures.push(err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(set)
    }

    fn open(&self) -> Result<Box<dyn HardwareSession + '_>, DeviceError> {
        self.source
            .acquire()
            .map_err(|e| DeviceError::HardwareUnavailable(e.to_string()))
    }
}

fn count(session: &dyn HardwareSession) -> Result<u32, DeviceError> {
    session
        .device_count()
        .map_err(|e| DeviceError::HardwareUnavailable(e.to_string()))
}

fn read(session: &dyn HardwareSession, index: u32) -> Result<DeviceSnapshot, DeviceError> {
    let raw = session
        .read_device(index)
        .map_err(|e| DeviceError::query_failed(index, e))?;
    DeviceSnapshot::from_reading(index, raw)
}

/// Power or memory gauge in the diagnostic line
#[derive(Debug, Serialize)]
struct Gauge {
    usage: f64,
    limit: f64,
    percent: Option<f64>,
}

/// Snapshot shape printed once per cycle
#[derive(Debug, Serialize)]
struct SnapshotLine<'a> {
    index: u32,
    name: &'a str,
    fan_speed: u32,
    temperature: f64,
    performance_state: u32,
    power: Gauge,
    memory: Gauge,
}

/// Serialize a cycle's snapshots as one JSON line
pub fn diagnostic_line(snapshots: &[DeviceSnapshot]) -> serde_json::Result<String> {
    let lines: Vec<SnapshotLine<'_>> = snapshots
        .iter()
        .map(|s| SnapshotLine {
            index: s.index,
            name: &s.name,
            fan_speed: s.fan_speed_pct,
            temperature: s.temperature_c,
            performance_state: s.performance_state,
            power: Gauge {
                usage: s.power_usage_w,
                limit: s.power_limit_w,
                percent: s.power_percent().ok(),
            },
            memory: Gauge {
                usage: s.memory_used_mb,
                limit: s.memory_total_mb,
                percent: s.memory_percent().ok(),
            },
        })
        .collect();
    serde_json::to_string(&lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryCause;
    use crate::testing::{reading, FakeSource};
    use std::time::Duration;

    #[test]
    fn test_from_reading_converts_units() {
        let snapshot = DeviceSnapshot::from_reading(0, reading("RTX", 512, 1024)).unwrap();
        assert_eq!(snapshot.power_usage_w, 150.0);
        assert_eq!(snapshot.power_limit_w, 300.0);
        assert_eq!(snapshot.memory_used_mb, 512.0);
        assert_eq!(snapshot.memory_total_mb, 1024.0);
        assert_eq!(snapshot.temperature_c, 65.0);
        assert_eq!(snapshot.memory_percent().unwrap(), 50.0);
        assert_eq!(snapshot.power_percent().unwrap(), 50.0);
    }

    #[test]
    fn test_zero_memory_total_rejected() {
        let err = DeviceSnapshot::from_reading(2, reading("RTX", 0, 0)).unwrap_err();
        assert_eq!(
            err,
            DeviceError::DeviceQueryFailed {
                index: 2,
                cause: QueryCause::ZeroDenominator { field: "memory_total" },
            }
        );
    }

    #[test]
    fn test_zero_power_limit_rejected() {
        let mut raw = reading("RTX", 512, 1024);
        raw.power_limit_mw = 0;
        let err = DeviceSnapshot::from_reading(1, raw).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::DeviceQueryFailed {
                index: 1,
                cause: QueryCause::ZeroDenominator { field: "power_limit" }
            }
        ));
    }

    #[test]
    fn test_over_limit_readings_pass_through() {
        let snapshot = DeviceSnapshot::from_reading(0, reading("RTX", 2048, 1024)).unwrap();
        assert_eq!(snapshot.memory_percent().unwrap(), 200.0);
    }

    #[test]
    fn test_snapshot_all_in_index_order() {
        let source = Arc::new(FakeSource::with_devices(3));
        let reader = DeviceReader::new(source.clone(), DevicePolicy::Strict);

        let set = reader.snapshot_all().unwrap();
        let indices: Vec<u32> = set.snapshots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(set.failures.is_empty());
        assert_eq!(source.acquisitions(), 1);
        assert_eq!(source.releases(), 1);
    }

    #[test]
    fn test_strict_policy_fails_whole_call() {
        let source = Arc::new(FakeSource::with_devices(3).failing_device(1));
        let reader = DeviceReader::new(source.clone(), DevicePolicy::Strict);

        let err = reader.snapshot_all().unwrap_err();
        assert!(matches!(err, DeviceError::DeviceQueryFailed { index: 1, .. }));
        // session released even though the enumeration stopped halfway
        assert_eq!(source.releases(), 1);
    }

    #[test]
    fn test_partial_policy_keeps_readable_devices() {
        let source = Arc::new(FakeSource::with_devices(3).failing_device(1));
        let reader = DeviceReader::new(source, DevicePolicy::Partial);

        let set = reader.snapshot_all().unwrap();
        let indices: Vec<u32> = set.snapshots.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(set.failures.len(), 1);
        assert!(matches!(set.failures[0], DeviceError::DeviceQueryFailed { index: 1, .. }));
    }

    #[test]
    fn test_unavailable_hardware() {
        let source = Arc::new(FakeSource::unavailable());
        let reader = DeviceReader::new(source, DevicePolicy::Partial);

        assert!(matches!(reader.count_devices(), Err(DeviceError::HardwareUnavailable(_))));
        assert!(matches!(reader.snapshot_all(), Err(DeviceError::HardwareUnavailable(_))));
    }

    #[test]
    fn test_single_snapshot_releases_session_on_failure() {
        let source = Arc::new(FakeSource::with_devices(2).failing_device(0));
        let reader = DeviceReader::new(source.clone(), DevicePolicy::Strict);

        assert!(reader.snapshot(0).is_err());
        assert_eq!(reader.snapshot(1).unwrap().index, 1);
        assert_eq!(source.acquisitions(), 2);
        assert_eq!(source.releases(), 2);
    }

    #[test]
    fn test_diagnostic_line_shape() {
        let snapshot = DeviceSnapshot::from_reading(0, reading("RTX 4090", 512, 1024)).unwrap();
        let line = diagnostic_line(&[snapshot]).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();

        assert!(!line.contains('\n'));
        assert_eq!(value[0]["name"], "RTX 4090");
        assert_eq!(value[0]["memory"]["percent"], 50.0);
        assert_eq!(value[0]["power"]["limit"], 300.0);
    }

    #[tokio::test]
    async fn test_slow_device_count_leaves_runtime_free() {
        let source = FakeSource::with_devices(2).with_acquire_delay(Duration::from_millis(300));
        let reader = DeviceReader::new(Arc::new(source), DevicePolicy::Strict);

        // single-threaded runtime: the timer only fires if the count runs elsewhere
        let timer = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            std::time::Instant::now()
        });
        let count = reader.count_devices_off_runtime().await.unwrap();
        let counted_at = std::time::Instant::now();

        assert_eq!(count, 2);
        assert!(timer.await.unwrap() < counted_at);
    }
}
