//! Sampling loop
//!
//! Drives sample → map → publish on a fixed interval measured from the start
//! of each tick. A failing cycle is logged and reported, then the loop waits
//! for the next tick; only the shutdown token ends it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{diagnostic_line, DeviceReader, DeviceSnapshot, SnapshotSet};
use crate::error::{DeviceError, PublishError};
use crate::mapper;
use crate::publisher::{PublishReport, Publisher};

const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Scheduler inputs fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub host: String,
    pub namespace: String,
    pub interval: Duration,
    pub emit_snapshots: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Sampling,
    Mapping,
    Publishing,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CycleError {
    #[error("sampling failed: {0}")]
    Sampling(DeviceError),

    #[error("mapping failed: {0}")]
    Mapping(DeviceError),

    #[error("{0}")]
    Publishing(PublishError),

    #[error("sampling worker died: {0}")]
    Join(String),
}

impl CycleError {
    pub fn kind(&self) -> &'static str {
        match self {
            CycleError::Sampling(e) | CycleError::Mapping(e) => e.kind(),
            CycleError::Publishing(_) => "publish_error",
            CycleError::Join(_) => "join_error",
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub cycle: u64,
    /// Timestamp shared by every point of the cycle
    pub started_at: DateTime<Utc>,
    /// Runtime clock at cycle start
    pub started: Instant,
    pub snapshots: Vec<DeviceSnapshot>,
    /// Devices skipped under the partial policy
    pub device_failures: Vec<DeviceError>,
    pub result: Result<PublishReport, CycleError>,
}

pub struct Scheduler {
    config: Arc<ScheduleConfig>,
    reader: Arc<DeviceReader>,
    publisher: Publisher,
    state: watch::Sender<SchedulerState>,
    outcomes: Option<mpsc::UnboundedSender<CycleOutcome>>,
}

impl Scheduler {
    pub fn new(config: ScheduleConfig, reader: DeviceReader, publisher: Publisher) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        Self {
            config: Arc::new(config),
            reader: Arc::new(reader),
            publisher,
            state,
            outcomes: None,
        }
    }

    /// Send every cycle outcome to `tx`
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<CycleOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Flush the sink; for callers driving `run_cycle` themselves.
    /// Gives up after `SINK_CLOSE_TIMEOUT`.
    pub async fn close(&self) {
        if timeout(SINK_CLOSE_TIMEOUT, self.publisher.close()).await.is_err() {
            warn!("Sink did not close within {:?}", SINK_CLOSE_TIMEOUT);
        }
    }

    /// Run until `shutdown` is cancelled. Cancellation interrupts both the
    /// sleep and an in-flight cycle.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            host = %self.config.host,
            namespace = %self.config.namespace,
            interval_secs = self.config.interval.as_secs_f64(),
            "Starting sampling loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycle = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            cycle += 1;
            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(cycle, "Shutdown requested mid-cycle");
                    break;
                }
                outcome = self.run_cycle(cycle) => outcome,
            };
            self.report(outcome);
            self.set_state(SchedulerState::Sleeping);
        }

        self.close().await;
        self.set_state(SchedulerState::Stopped);
        info!(cycles = cycle, "Sampling loop stopped");
    }

    /// One sample → map → publish pass
    pub async fn run_cycle(&self, cycle: u64) -> CycleOutcome {
        let started = Instant::now();
        let timestamp = Utc::now();
        let mut outcome = CycleOutcome {
            cycle,
            started_at: timestamp,
            started,
            snapshots: Vec::new(),
            device_failures: Vec::new(),
            result: Ok(PublishReport::default()),
        };

        self.set_state(SchedulerState::Sampling);
        let set = match self.sample().await {
            Ok(set) => set,
            Err(err) => {
                outcome.result = Err(err);
                return outcome;
            }
        };
        debug!(cycle, devices = set.snapshots.len(), "Devices sampled");
        if self.config.emit_snapshots {
            match diagnostic_line(&set.snapshots) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to serialize snapshots: {}", e),
            }
        }
        outcome.snapshots = set.snapshots;
        outcome.device_failures = set.failures;

        self.set_state(SchedulerState::Mapping);
        let points = match mapper::map_all(&outcome.snapshots, timestamp, &self.config.host) {
            Ok(points) => points,
            Err(err) => {
                outcome.result = Err(CycleError::Mapping(err));
                return outcome;
            }
        };

        self.set_state(SchedulerState::Publishing);
        outcome.result = self
            .publisher
            .publish(&self.config.namespace, points)
            .await
            .map_err(CycleError::Publishing);
        outcome
    }

    /// NVML calls block; keep them and the session off the async workers
    async fn sample(&self) -> Result<SnapshotSet, CycleError> {
        let reader = Arc::clone(&self.reader);
        match tokio::task::spawn_blocking(move || reader.snapshot_all()).await {
            Ok(result) => result.map_err(CycleError::Sampling),
            Err(e) => Err(CycleError::Join(e.to_string())),
        }
    }

    fn report(&self, outcome: CycleOutcome) {
        for failure in &outcome.device_failures {
            warn!(
                cycle = outcome.cycle,
                error.kind = failure.kind(),
                cause = %failure,
                "Device skipped this cycle"
            );
        }

        match &outcome.result {
            Ok(report) if report.is_complete() => {
                info!(
                    cycle = outcome.cycle,
                    devices = outcome.snapshots.len(),
                    points = report.accepted.len(),
                    "Cycle complete"
                );
            }
            Ok(report) => {
                for failed in &report.failed {
                    warn!(
                        cycle = outcome.cycle,
                        metric = failed.point.name(),
                        device_index = failed.point.dimension(mapper::DIM_DEVICE_INDEX).unwrap_or("?"),
                        error.kind = failed.error.kind.as_str(),
                        cause = %failed.error.message,
                        "Metric point rejected"
                    );
                }
                warn!(
                    cycle = outcome.cycle,
                    accepted = report.accepted.len(),
                    failed = report.failed.len(),
                    "Cycle partially published"
                );
            }
            Err(err) => {
                error!(
                    cycle = outcome.cycle,
                    error.kind = err.kind(),
                    cause = %err,
                    timestamp = %outcome.started_at.to_rfc3339(),
                    "Cycle failed, retrying next tick"
                );
            }
        }

        if let Some(tx) = &self.outcomes {
            // Observer gone is not our problem
            let _ = tx.send(outcome);
        }
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.send_replace(state);
    }
}
