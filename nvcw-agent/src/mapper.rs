//! Snapshot to metric points
//!
//! Every device expands to the same seven points, in a fixed order. Names,
//! units and dimension keys are what dashboards on the backend query, so
//! they must not change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::DeviceSnapshot;
use crate::error::DeviceError;

pub const DIM_DEVICE_INDEX: &str = "device_index";
pub const DIM_HOST: &str = "host";

pub const FAN_SPEED: &str = "fan_speed";
pub const TEMPERATURE: &str = "temperature";
pub const PERFORMANCE_STATE: &str = "performance_state";
pub const MEMORY_USAGE: &str = "memory_usage";
pub const MEMORY_PERCENT: &str = "memory_percent";
pub const POWER_USAGE: &str = "power_usage";
pub const POWER_PERCENT: &str = "power_percent";

/// Points per device, in emission order
pub const METRIC_NAMES: [&str; 7] = [
    FAN_SPEED,
    TEMPERATURE,
    PERFORMANCE_STATE,
    MEMORY_USAGE,
    MEMORY_PERCENT,
    POWER_USAGE,
    POWER_PERCENT,
];

/// Metric unit, spelled the way the backend expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    None,
    Percent,
    Megabytes,
}

/// A named, dimensioned, timestamped observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(rename = "metric_name")]
    name: String,
    dimensions: BTreeMap<String, String>,
    timestamp: DateTime<Utc>,
    value: f64,
    unit: Unit,
}

impl MetricPoint {
    pub fn new(
        name: impl Into<String>,
        dimensions: BTreeMap<String, String>,
        timestamp: DateTime<Utc>,
        value: f64,
        unit: Unit,
    ) -> Self {
        Self {
            name: name.into(),
            dimensions,
            timestamp,
            value,
            unit,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimensions(&self) -> &BTreeMap<String, String> {
        &self.dimensions
    }

    pub fn dimension(&self, key: &str) -> Option<&str> {
        self.dimensions.get(key).map(String::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    /// Size of the point once serialized, used to size batches
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Expand one snapshot into its seven points
pub fn map(
    snapshot: &DeviceSnapshot,
    timestamp: DateTime<Utc>,
    host: &str,
) -> Result<Vec<MetricPoint>, DeviceError> {
    let memory_percent = snapshot.memory_percent()?;
    let power_percent = snapshot.power_percent()?;

    let mut dimensions = BTreeMap::new();
    dimensions.insert(DIM_DEVICE_INDEX.to_string(), snapshot.index.to_string());
    dimensions.insert(DIM_HOST.to_string(), host.to_string());

    let point = |name: &str, value: f64, unit: Unit| {
        MetricPoint::new(name, dimensions.clone(), timestamp, value, unit)
    };

    Ok(vec![
        point(FAN_SPEED, f64::from(snapshot.fan_speed_pct), Unit::Percent),
        point(TEMPERATURE, snapshot.temperature_c, Unit::None),
        point(PERFORMANCE_STATE, f64::from(snapshot.performance_state), Unit::None),
        point(MEMORY_USAGE, snapshot.memory_used_mb, Unit::Megabytes),
        point(MEMORY_PERCENT, memory_percent, Unit::Percent),
        point(POWER_USAGE, snapshot.power_usage_w, Unit::None),
        point(POWER_PERCENT, power_percent, Unit::Percent),
    ])
}

/// Concatenate the points of every snapshot, device by device
pub fn map_all(
    snapshots: &[DeviceSnapshot],
    timestamp: DateTime<Utc>,
    host: &str,
) -> Result<Vec<MetricPoint>, DeviceError> {
    let mut points = Vec::with_capacity(snapshots.len() * METRIC_NAMES.len());
    for snapshot in snapshots {
        points.extend(map(snapshot, timestamp, host)?);
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(index: u32) -> DeviceSnapshot {
        DeviceSnapshot {
            index,
            name: "NVIDIA GeForce RTX 3090".to_string(),
            fan_speed_pct: 45,
            temperature_c: 71.0,
            performance_state: 2,
            power_usage_w: 87.5,
            power_limit_w: 350.0,
            memory_used_mb: 512.0,
            memory_total_mb: 1024.0,
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_map_field_by_field() {
        let points = map(&snapshot(0), ts(), "ws-01").unwrap();
        let expected = [
            (FAN_SPEED, 45.0, Unit::Percent),
            (TEMPERATURE, 71.0, Unit::None),
            (PERFORMANCE_STATE, 2.0, Unit::None),
            (MEMORY_USAGE, 512.0, Unit::Megabytes),
            (MEMORY_PERCENT, 50.0, Unit::Percent),
            (POWER_USAGE, 87.5, Unit::None),
            (POWER_PERCENT, 25.0, Unit::Percent),
        ];

        assert_eq!(points.len(), 7);
        for (point, (name, value, unit)) in points.iter().zip(expected) {
            assert_eq!(point.name(), name);
            assert_eq!(point.value(), value, "value of {name}");
            assert_eq!(point.unit(), unit, "unit of {name}");
        }
    }

    #[test]
    fn test_points_share_timestamp_and_dimensions() {
        let points = map(&snapshot(3), ts(), "ws-01").unwrap();
        for point in &points {
            assert_eq!(point.timestamp(), ts());
            assert_eq!(point.dimension(DIM_DEVICE_INDEX), Some("3"));
            assert_eq!(point.dimension(DIM_HOST), Some("ws-01"));
            assert_eq!(point.dimensions().len(), 2);
        }
    }

    #[test]
    fn test_zero_denominators_never_produce_nan() {
        let mut s = snapshot(0);
        s.memory_total_mb = 0.0;
        assert!(matches!(map(&s, ts(), "h"), Err(DeviceError::DeviceQueryFailed { index: 0, .. })));

        let mut s = snapshot(1);
        s.power_limit_w = 0.0;
        assert!(matches!(map(&s, ts(), "h"), Err(DeviceError::DeviceQueryFailed { index: 1, .. })));
    }

    #[test]
    fn test_map_all_keeps_device_order() {
        let points = map_all(&[snapshot(0), snapshot(1)], ts(), "ws-01").unwrap();
        assert_eq!(points.len(), 14);
        assert!(points[..7].iter().all(|p| p.dimension(DIM_DEVICE_INDEX) == Some("0")));
        assert!(points[7..].iter().all(|p| p.dimension(DIM_DEVICE_INDEX) == Some("1")));
        let names: Vec<&str> = points[7..].iter().map(|p| p.name()).collect();
        assert_eq!(names, METRIC_NAMES);
    }

    #[test]
    fn test_point_wire_format() {
        let points = map(&snapshot(0), ts(), "ws-01").unwrap();
        let value = serde_json::to_value(&points[4]).unwrap();
        assert_eq!(value["metric_name"], "memory_percent");
        assert_eq!(value["unit"], "Percent");
        assert_eq!(value["dimensions"]["device_index"], "0");
        assert_eq!(value["timestamp"], "2024-03-01T12:00:00Z");
        assert!(points[4].encoded_len() > 0);
    }
}
