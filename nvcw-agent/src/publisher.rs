//! Batched publishing with retry
//!
//! Points are split into batches the sink accepts (point count and payload
//! size), each batch goes through the retry policy, and the outcome of every
//! point lands in a `PublishReport`. Nothing is kept across calls: a cycle
//! that could not be delivered is dropped.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{PublishError, SinkError, SinkErrorKind};
use crate::mapper::MetricPoint;
use crate::retry::RetryPolicy;
use crate::sink::{MetricsSink, SinkResponse, ENVELOPE_OVERHEAD};

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    pub max_points_per_request: usize,
    pub max_payload_bytes: usize,
    /// Bound on a single sink call
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_points_per_request: 20,
            max_payload_bytes: 1024 * 1024,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// A point the sink did not store
#[derive(Debug, Clone, PartialEq)]
pub struct FailedPoint {
    pub point: MetricPoint,
    pub error: SinkError,
}

/// Per-point outcome of one publish call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub accepted: Vec<MetricPoint>,
    pub failed: Vec<FailedPoint>,
    /// Sink calls made, retries included
    pub requests: u32,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct Publisher {
    sink: Arc<dyn MetricsSink>,
    config: PublisherConfig,
}

impl Publisher {
    pub fn new(sink: Arc<dyn MetricsSink>, config: PublisherConfig) -> Self {
        Self { sink, config }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub async fn close(&self) {
        self.sink.close().await;
    }

    /// Deliver `points` under `namespace`.
    ///
    /// Returns `Err` only when nothing was accepted and at least one request
    /// failed as a whole; otherwise the report lists every point's outcome.
    pub async fn publish(
        &self,
        namespace: &str,
        points: Vec<MetricPoint>,
    ) -> Result<PublishReport, PublishError> {
        let mut report = PublishReport::default();
        let batches = self.into_batches(namespace, points, &mut report);
        debug!(namespace, batches = batches.len(), "Publishing metric batches");

        let mut last_error = None;
        for batch in batches {
            if let Err(err) = self.submit(namespace, batch, &mut report).await {
                last_error = Some(err);
            }
        }

        match last_error {
            Some(err) if report.accepted.is_empty() => {
                for failed in report.failed.iter().filter(|f| f.error.kind != err.kind) {
                    warn!(
                        namespace,
                        metric = failed.point.name(),
                        error.kind = failed.error.kind.as_str(),
                        cause = %failed.error.message,
                        "Metric point failed"
                    );
                }
                warn!(namespace, failed = report.failed.len(), requests = report.requests, "Nothing published");
                Err(PublishError {
                    failed_points: report.failed.len(),
                    ..PublishError::from(err)
                })
            }
            _ => {
                info!(
                    namespace,
                    accepted = report.accepted.len(),
                    failed = report.failed.len(),
                    requests = report.requests,
                    "Metrics published"
                );
                Ok(report)
            }
        }
    }

    /// Split in order under both sink limits. A point too large to ever fit
    /// is failed here instead of being sent.
    fn into_batches(
        &self,
        namespace: &str,
        points: Vec<MetricPoint>,
        report: &mut PublishReport,
    ) -> Vec<Vec<MetricPoint>> {
        let max_points = self.config.max_points_per_request.max(1);
        let max_bytes = self.config.max_payload_bytes;
        let envelope = ENVELOPE_OVERHEAD + namespace.len();

        let mut batches = Vec::new();
        let mut current: Vec<MetricPoint> = Vec::new();
        let mut current_bytes = envelope;

        for point in points {
            // +1 for the separating comma
            let size = point.encoded_len() + 1;
            if envelope + size > max_bytes {
                warn!(metric = point.name(), size, max_bytes, "Point exceeds payload limit");
                report.failed.push(FailedPoint {
                    point,
                    error: SinkError::new(
                        SinkErrorKind::Malformed,
                        format!("point of {} bytes exceeds the {} byte payload limit", size, max_bytes),
                    ),
                });
                continue;
            }
            if !current.is_empty() && (current.len() >= max_points || current_bytes + size > max_bytes) {
                batches.push(std::mem::take(&mut current));
                current_bytes = envelope;
            }
            current_bytes += size;
            current.push(point);
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Send one batch through the retry policy. Only points rejected with a
    /// retryable error are resubmitted after a partial ack.
    async fn submit(
        &self,
        namespace: &str,
        batch: Vec<MetricPoint>,
        report: &mut PublishReport,
    ) -> Result<(), SinkError> {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts();
        let mut pending = batch;
        let mut attempt = 1;

        loop {
            report.requests += 1;
            let outcome = match timeout(self.config.request_timeout, self.sink.put(namespace, &pending)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SinkError::new(
                    SinkErrorKind::Timeout,
                    format!("no answer within {:?}", self.config.request_timeout),
                )),
            };

            match outcome {
                Ok(SinkResponse::Ack) => {
                    report.accepted.extend(pending);
                    return Ok(());
                }
                Ok(SinkResponse::PartialAck { rejected }) => {
                    let retry = settle_partial(pending, rejected, report);
                    if retry.is_empty() {
                        return Ok(());
                    }
                    if attempt >= max_attempts {
                        warn!(attempt, points = retry.len(), "Retries exhausted for rejected points");
                        report
                            .failed
                            .extend(retry.into_iter().map(|(point, error)| FailedPoint { point, error }));
                        return Ok(());
                    }
                    warn!(attempt, points = retry.len(), "Resubmitting throttled points");
                    pending = retry.into_iter().map(|(point, _)| point).collect();
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "Sink request failed (retryable)");
                }
                Err(err) => {
                    warn!(attempt, error = %err, retryable = err.is_retryable(), "Sink request failed");
                    report.failed.extend(pending.into_iter().map(|point| FailedPoint {
                        point,
                        error: err.clone(),
                    }));
                    return Err(err);
                }
            }

            let delay = policy.backoff_delay(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Retrying after backoff");
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Record accepted and permanently rejected points; return the ones worth
/// another attempt with their last error.
fn settle_partial(
    pending: Vec<MetricPoint>,
    rejected: Vec<(usize, SinkError)>,
    report: &mut PublishReport,
) -> Vec<(MetricPoint, SinkError)> {
    let mut verdicts: Vec<Option<SinkError>> = vec![None; pending.len()];
    for (index, error) in rejected {
        match verdicts.get_mut(index) {
            Some(slot) => *slot = Some(error),
            None => warn!(index, batch_len = pending.len(), "Sink rejected an unknown point index"),
        }
    }

    let mut retry = Vec::new();
    for (point, verdict) in pending.into_iter().zip(verdicts) {
        match verdict {
            None => report.accepted.push(point),
            Some(error) if error.is_retryable() => retry.push((point, error)),
            Some(error) => report.failed.push(FailedPoint { point, error }),
        }
    }
    retry
}
