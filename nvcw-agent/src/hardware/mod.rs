//! Hardware monitoring seam
//!
//! A `HardwareSource` opens a monitoring session; the session answers device
//! queries and releases the underlying handle when dropped. Keeping the
//! session as a guard means every exit path of a snapshot (including a field
//! query failing halfway) gives the handle back.

#[cfg(feature = "nvml")]
mod nvml;

#[cfg(feature = "nvml")]
pub use nvml::NvmlSource;

use crate::error::HardwareError;

/// One device reading in the units the hardware reports
#[derive(Debug, Clone, PartialEq)]
pub struct RawDeviceReading {
    pub name: String,
    pub fan_speed_pct: u32,
    pub temperature_c: u32,
    pub performance_state: u32,
    pub power_usage_mw: u32,
    pub power_limit_mw: u32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
}

/// An open monitoring session. Dropping it releases the handle.
pub trait HardwareSession {
    fn device_count(&self) -> Result<u32, HardwareError>;

    fn read_device(&self, index: u32) -> Result<RawDeviceReading, HardwareError>;
}

/// Something able to open monitoring sessions
pub trait HardwareSource: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn HardwareSession + '_>, HardwareError>;
}
