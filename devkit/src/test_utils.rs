/*!
Test Harness pour le pipeline nvcw

Facilite l'écriture de tests de bout en bout avec:
- Un scheduler réel branché sur les stubs GPU et sink
- L'attente des résultats de cycle avec timeout
- Un arrêt contrôlé avec mesure du temps d'arrêt
*/

use crate::hardware_stub::FakeGpuSource;
use crate::sink_stub::MockMetricsSink;
use anyhow::{Context, Result};
use nvcw_agent::retry::RetryPolicy;
use nvcw_agent::{
    CycleOutcome, DevicePolicy, DeviceReader, PublisherConfig, Publisher, ScheduleConfig, Scheduler,
    SchedulerState,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Délai d'attente par défaut pour un cycle
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Harness de test complet pour le pipeline
pub struct TestHarness {
    pub gpus: FakeGpuSource,
    pub sink: MockMetricsSink,
    schedule: ScheduleConfig,
    publisher: PublisherConfig,
    policy: DevicePolicy,
    running: Option<Running>,
}

struct Running {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    outcomes: mpsc::UnboundedReceiver<CycleOutcome>,
    state: watch::Receiver<SchedulerState>,
}

impl TestHarness {
    /// Crée un harness avec `gpus` GPUs simulés
    pub fn new(gpus: u32) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        Self {
            gpus: FakeGpuSource::with_gpus(gpus),
            sink: MockMetricsSink::new(),
            schedule: ScheduleConfig {
                host: "test-ws".to_string(),
                namespace: "nvcw-test".to_string(),
                interval: Duration::from_secs(5),
                emit_snapshots: false,
            },
            publisher: PublisherConfig {
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(50),
                    jitter: 0.0,
                },
                ..PublisherConfig::default()
            },
            policy: DevicePolicy::Strict,
            running: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.schedule.interval = interval;
        self
    }

    pub fn with_policy(mut self, policy: DevicePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_publisher(mut self, publisher: PublisherConfig) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// Construit un scheduler non démarré sur les stubs
    pub fn scheduler(&self) -> Scheduler {
        let reader = DeviceReader::new(Arc::new(self.gpus.clone()), self.policy);
        let publisher = Publisher::new(Arc::new(self.sink.clone()), self.publisher.clone());
        Scheduler::new(self.schedule.clone(), reader, publisher)
    }

    /// Démarre la boucle dans une tâche tokio
    pub fn start(&mut self) -> &mut Self {
        let (tx, outcomes) = mpsc::unbounded_channel();
        let scheduler = self.scheduler().with_outcomes(tx);
        let state = scheduler.subscribe_state();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(shutdown.clone()));

        log::info!("🚀 Scheduler started, interval {:?}", self.schedule.interval);
        self.running = Some(Running { shutdown, handle, outcomes, state });
        self
    }

    /// Attend le prochain résultat de cycle
    pub async fn next_outcome(&mut self) -> Result<CycleOutcome> {
        let running = self.running.as_mut().context("scheduler not started")?;
        let outcome = timeout(DEFAULT_TIMEOUT, running.outcomes.recv())
            .await
            .context("timeout waiting for cycle outcome")?
            .context("scheduler stopped before reporting")?;
        log::info!("✅ Cycle {} reported", outcome.cycle);
        Ok(outcome)
    }

    /// Attend `count` résultats de cycle consécutifs
    pub async fn wait_for_cycles(&mut self, count: usize) -> Result<Vec<CycleOutcome>> {
        let mut outcomes = Vec::with_capacity(count);
        for _ in 0..count {
            outcomes.push(self.next_outcome().await?);
        }
        Ok(outcomes)
    }

    /// État courant du scheduler
    pub fn state(&self) -> Option<SchedulerState> {
        self.running.as_ref().map(|running| *running.state.borrow())
    }

    /// Attend que le scheduler atteigne `wanted`
    pub async fn wait_for_state(&mut self, wanted: SchedulerState) -> Result<()> {
        let running = self.running.as_mut().context("scheduler not started")?;
        timeout(DEFAULT_TIMEOUT, running.state.wait_for(|state| *state == wanted))
            .await
            .context("timeout waiting for scheduler state")?
            .context("scheduler dropped its state channel")?;
        Ok(())
    }

    /// Annule la boucle et attend sa fin; renvoie le temps d'arrêt
    pub async fn stop(&mut self) -> Result<Duration> {
        let running = self.running.take().context("scheduler not started")?;
        let started = Instant::now();
        running.shutdown.cancel();
        timeout(DEFAULT_TIMEOUT, running.handle)
            .await
            .context("timeout waiting for scheduler to stop")?
            .context("scheduler task panicked")?;

        let elapsed = started.elapsed();
        let state = *running.state.borrow();
        anyhow::ensure!(state == SchedulerState::Stopped, "scheduler ended in {:?}", state);
        log::info!("🛑 Scheduler stopped in {:?}", elapsed);
        Ok(elapsed)
    }

    /// Stats sur les points reçus par le sink
    pub fn get_stats(&self) -> TestStats {
        let requests = self.sink.get_requests();
        let mut metric_counts = HashMap::new();
        for point in requests.iter().flat_map(|request| request.points.iter()) {
            *metric_counts.entry(point.name().to_string()).or_insert(0) += 1;
        }

        TestStats {
            total_requests: requests.len(),
            total_points: metric_counts.values().sum(),
            metric_counts,
            sessions_opened: self.gpus.acquisitions(),
            sessions_released: self.gpus.releases(),
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
        }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_requests: usize,
    pub total_points: usize,
    pub metric_counts: HashMap<String, usize>,
    pub sessions_opened: usize,
    pub sessions_released: usize,
}

impl TestStats {
    pub fn print(&self) {
        println!("📊 Test Statistics:");
        println!("  Requests: {}", self.total_requests);
        println!("  Points: {}", self.total_points);
        for (metric, count) in &self.metric_counts {
            println!("    {}: {} points", metric, count);
        }
        println!(
            "  Sessions: {} opened, {} released",
            self.sessions_opened, self.sessions_released
        );
    }
}
