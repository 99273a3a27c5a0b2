//! Metrics sinks
//!
//! A sink takes one batch of points for a namespace and answers with a full
//! ack, a partial ack naming the rejected points, or an error for the whole
//! request. Two transports ship with the agent:
//! - MQTT broker (`rumqttc`), one message per batch
//! - HTTP JSON ingest endpoint (`reqwest`) with per-point rejections

mod http;
mod mqtt;

pub use http::HttpSink;
pub use mqtt::MqttSink;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SinkConfig, SinkKind};
use crate::error::{ConfigError, SinkError};
use crate::mapper::MetricPoint;

/// Bytes the batch envelope adds around the points, besides the namespace
pub const ENVELOPE_OVERHEAD: usize = 64;

/// Sink answer to an accepted request
#[derive(Debug, Clone, PartialEq)]
pub enum SinkResponse {
    Ack,
    /// Points rejected by position in the submitted batch; the rest were stored
    PartialAck { rejected: Vec<(usize, SinkError)> },
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put(&self, namespace: &str, points: &[MetricPoint]) -> Result<SinkResponse, SinkError>;

    /// Flush whatever the transport still buffers. Called once on shutdown.
    async fn close(&self) {}
}

/// Body shared by every transport
#[derive(Debug, Serialize)]
pub struct BatchPayload<'a> {
    pub namespace: &'a str,
    pub metric_data: &'a [MetricPoint],
}

/// Build the configured sink. Must run inside the tokio runtime.
pub fn from_config(
    config: &SinkConfig,
    host: &str,
    max_payload_bytes: usize,
    request_timeout: Duration,
) -> Result<Arc<dyn MetricsSink>, ConfigError> {
    match config.kind {
        SinkKind::Mqtt => Ok(Arc::new(MqttSink::connect(&config.mqtt, host, max_payload_bytes))),
        SinkKind::Http => {
            let sink = HttpSink::new(&config.http, request_timeout)
                .map_err(|e| ConfigError::InvalidSink(e.to_string()))?;
            Ok(Arc::new(sink))
        }
    }
}
