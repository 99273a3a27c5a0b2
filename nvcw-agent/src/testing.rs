//! In-crate fakes for unit tests

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{HardwareError, SinkError};
use crate::hardware::{HardwareSession, HardwareSource, RawDeviceReading};
use crate::mapper::{MetricPoint, Unit};
use crate::sink::{MetricsSink, SinkResponse};

const MB: u64 = 1024 * 1024;

pub fn reading(name: &str, used_mb: u64, total_mb: u64) -> RawDeviceReading {
    RawDeviceReading {
        name: name.to_string(),
        fan_speed_pct: 40,
        temperature_c: 65,
        performance_state: 2,
        power_usage_mw: 150_000,
        power_limit_mw: 300_000,
        memory_used_bytes: used_mb * MB,
        memory_total_bytes: total_mb * MB,
    }
}

/// `n` distinct points of identical encoded size
pub fn points(n: usize) -> Vec<MetricPoint> {
    let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
    let mut dimensions = BTreeMap::new();
    dimensions.insert("device_index".to_string(), "0".to_string());
    dimensions.insert("host".to_string(), "test-host".to_string());
    (0..n)
        .map(|i| MetricPoint::new(format!("metric_{:02}", i), dimensions.clone(), timestamp, 1.5, Unit::None))
        .collect()
}

pub struct FakeSource {
    devices: u32,
    failing: HashSet<u32>,
    unavailable: bool,
    acquire_delay: Option<Duration>,
    acquisitions: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl FakeSource {
    pub fn with_devices(devices: u32) -> Self {
        Self {
            devices,
            failing: HashSet::new(),
            unavailable: false,
            acquire_delay: None,
            acquisitions: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::with_devices(0) }
    }

    pub fn failing_device(mut self, index: u32) -> Self {
        self.failing.insert(index);
        self
    }

    /// `acquire` blocks the calling thread for `delay`, like a slow driver init
    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

struct FakeSession<'a> {
    source: &'a FakeSource,
}

impl Drop for FakeSession<'_> {
    fn drop(&mut self) {
        self.source.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl HardwareSession for FakeSession<'_> {
    fn device_count(&self) -> Result<u32, HardwareError> {
        Ok(self.source.devices)
    }

    fn read_device(&self, index: u32) -> Result<RawDeviceReading, HardwareError> {
        if self.source.failing.contains(&index) {
            return Err(HardwareError::query("fan_speed", "Not Supported"));
        }
        Ok(reading(&format!("GPU {}", index), 512, 1024))
    }
}

impl HardwareSource for FakeSource {
    fn acquire(&self) -> Result<Box<dyn HardwareSession + '_>, HardwareError> {
        if let Some(delay) = self.acquire_delay {
            std::thread::sleep(delay);
        }
        if self.unavailable {
            return Err(HardwareError::Unavailable("driver not loaded".to_string()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession { source: self }))
    }
}

#[derive(Debug, Clone)]
pub enum Scripted {
    Ack,
    Partial(Vec<(usize, SinkError)>),
    Fail(SinkError),
    Stall(Duration),
}

/// Answers from a script, then with `fallback`
pub struct ScriptedSink {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    calls: Mutex<Vec<Vec<MetricPoint>>>,
    close_stall: Option<Duration>,
    closes: AtomicUsize,
}

impl Default for ScriptedSink {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ScriptedSink {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Scripted::Ack,
            calls: Mutex::new(Vec::new()),
            close_stall: None,
            closes: AtomicUsize::new(0),
        }
    }

    /// `close` sleeps for `duration` before returning
    pub fn with_close_stall(mut self, duration: Duration) -> Self {
        self.close_stall = Some(duration);
        self
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn always(response: Scripted) -> Self {
        Self { fallback: response, ..Self::new(Vec::new()) }
    }

    pub fn calls(&self) -> Vec<Vec<MetricPoint>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricsSink for ScriptedSink {
    async fn put(&self, _namespace: &str, points: &[MetricPoint]) -> Result<SinkResponse, SinkError> {
        self.calls.lock().unwrap().push(points.to_vec());
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| self.fallback.clone()) {
            Scripted::Ack => Ok(SinkResponse::Ack),
            Scripted::Partial(rejected) => Ok(SinkResponse::PartialAck { rejected }),
            Scripted::Fail(err) => Err(err),
            Scripted::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(SinkResponse::Ack)
            }
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if let Some(duration) = self.close_stall {
            tokio::time::sleep(duration).await;
        }
    }
}
