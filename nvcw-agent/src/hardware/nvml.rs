//! NVIDIA Management Library source
//!
//! `nvml-wrapper` loads libnvidia-ml at runtime, so hosts without the driver
//! only fail at `acquire` with `HardwareError::Unavailable`.

use nvml_wrapper::enum_wrappers::device::{PerformanceState, TemperatureSensor};
use nvml_wrapper::Nvml;
use tracing::debug;

use super::{HardwareSession, HardwareSource, RawDeviceReading};
use crate::error::HardwareError;

/// NVML reports this code for an unknown P-state
const UNKNOWN_PSTATE: u32 = 32;

/// Opens one NVML session per acquire
#[derive(Debug, Default, Clone, Copy)]
pub struct NvmlSource;

impl NvmlSource {
    pub fn new() -> Self {
        Self
    }
}

impl HardwareSource for NvmlSource {
    fn acquire(&self) -> Result<Box<dyn HardwareSession + '_>, HardwareError> {
        let nvml = Nvml::init().map_err(|e| HardwareError::Unavailable(e.to_string()))?;
        debug!("NVML session opened");
        Ok(Box::new(NvmlSession { nvml }))
    }
}

/// Owns the initialized library; `Nvml`'s own drop runs nvmlShutdown
struct NvmlSession {
    nvml: Nvml,
}

impl Drop for NvmlSession {
    fn drop(&mut self) {
        debug!("NVML session released");
    }
}

impl HardwareSession for NvmlSession {
    fn device_count(&self) -> Result<u32, HardwareError> {
        self.nvml
            .device_count()
            .map_err(|e| HardwareError::Unavailable(e.to_string()))
    }

    fn read_device(&self, index: u32) -> Result<RawDeviceReading, HardwareError> {
        let device = self
            .nvml
            .device_by_index(index)
            .map_err(|e| HardwareError::query("handle", e))?;

        let name = device.name().map_err(|e| HardwareError::query("name", e))?;
        let fan_speed_pct = device.fan_speed(0).map_err(|e| HardwareError::query("fan_speed", e))?;
        let temperature_c = device
            .temperature(TemperatureSensor::Gpu)
            .map_err(|e| HardwareError::query("temperature", e))?;
        let performance_state = device
            .performance_state()
            .map(pstate_code)
            .map_err(|e| HardwareError::query("performance_state", e))?;
        let power_usage_mw = device
            .power_usage()
            .map_err(|e| HardwareError::query("power_usage", e))?;
        let power_limit_mw = device
            .power_management_limit()
            .map_err(|e| HardwareError::query("power_limit", e))?;
        let memory = device
            .memory_info()
            .map_err(|e| HardwareError::query("memory_info", e))?;

        Ok(RawDeviceReading {
            name,
            fan_speed_pct,
            temperature_c,
            performance_state,
            power_usage_mw,
            power_limit_mw,
            memory_used_bytes: memory.used,
            memory_total_bytes: memory.total,
        })
    }
}

fn pstate_code(state: PerformanceState) -> u32 {
    match state {
        PerformanceState::Zero => 0,
        PerformanceState::One => 1,
        PerformanceState::Two => 2,
        PerformanceState::Three => 3,
        PerformanceState::Four => 4,
        PerformanceState::Five => 5,
        PerformanceState::Six => 6,
        PerformanceState::Seven => 7,
        PerformanceState::Eight => 8,
        PerformanceState::Nine => 9,
        PerformanceState::Ten => 10,
        PerformanceState::Eleven => 11,
        PerformanceState::Twelve => 12,
        PerformanceState::Thirteen => 13,
        PerformanceState::Fourteen => 14,
        PerformanceState::Fifteen => 15,
        #[allow(unreachable_patterns)]
        _ => UNKNOWN_PSTATE,
    }
}
