//! nvcw agent - GPU telemetry sampling and publishing
//!
//! Samples every NVIDIA GPU through NVML on a fixed interval, turns each
//! reading into named metric points and ships them to a metrics backend:
//! - `device`: per-GPU snapshots behind a hardware seam
//! - `mapper`: snapshot → metric points
//! - `publisher`: batching, retries and partial acknowledgements
//! - `scheduler`: the sampling loop

pub mod config;
pub mod device;
pub mod error;
pub mod hardware;
pub mod identity;
pub mod mapper;
pub mod publisher;
pub mod retry;
pub mod scheduler;
pub mod sink;

#[cfg(test)]
mod testing;

pub use config::{AgentConfig, Overrides, ResolvedConfig};
pub use device::{DevicePolicy, DeviceReader, DeviceSnapshot, SnapshotSet};
pub use error::{ConfigError, DeviceError, HardwareError, PublishError, SinkError, SinkErrorKind};
pub use mapper::{MetricPoint, Unit};
pub use publisher::{PublishReport, Publisher, PublisherConfig};
pub use scheduler::{CycleError, CycleOutcome, ScheduleConfig, Scheduler, SchedulerState};
pub use sink::{MetricsSink, SinkResponse};
