use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BatchPayload, MetricsSink, SinkResponse};
use crate::config::HttpConfig;
use crate::error::{SinkError, SinkErrorKind};
use crate::mapper::MetricPoint;

/// Longest response body quoted in an error message
const MAX_ERROR_BODY: usize = 256;

/// POSTs batches to a JSON ingest endpoint
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

/// Optional body of a 2xx answer
#[derive(Debug, Default, Deserialize)]
struct IngestResponse {
    #[serde(default)]
    rejected: Vec<Rejection>,
}

#[derive(Debug, Deserialize)]
struct Rejection {
    index: usize,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

impl HttpSink {
    pub fn new(config: &HttpConfig, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("nvcw-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone().unwrap_or_default(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl MetricsSink for HttpSink {
    async fn put(&self, namespace: &str, points: &[MetricPoint]) -> Result<SinkResponse, SinkError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&BatchPayload { namespace, metric_data: points });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if let Some(kind) = kind_for_status(status) {
            let mut message = format!("HTTP {}", status.as_u16());
            if !body.is_empty() {
                message.push_str(": ");
                message.extend(body.chars().take(MAX_ERROR_BODY));
            }
            return Err(SinkError::new(kind, message));
        }

        debug!(status = status.as_u16(), points = points.len(), "Batch accepted by ingest endpoint");
        Ok(parse_ack(&body))
    }
}

fn transport_error(err: reqwest::Error) -> SinkError {
    let kind = if err.is_timeout() {
        SinkErrorKind::Timeout
    } else {
        SinkErrorKind::Transport
    };
    SinkError::new(kind, err.to_string())
}

/// `None` for success statuses
fn kind_for_status(status: StatusCode) -> Option<SinkErrorKind> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => SinkErrorKind::Throttled,
        StatusCode::REQUEST_TIMEOUT => SinkErrorKind::Timeout,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SinkErrorKind::Unauthorized,
        s if s.is_server_error() => SinkErrorKind::Unavailable,
        _ => SinkErrorKind::Malformed,
    })
}

fn kind_for_code(code: Option<&str>) -> SinkErrorKind {
    match code {
        Some("throttled") | Some("throttling") => SinkErrorKind::Throttled,
        Some("unavailable") => SinkErrorKind::Unavailable,
        Some("timeout") => SinkErrorKind::Timeout,
        Some("unauthorized") => SinkErrorKind::Unauthorized,
        _ => SinkErrorKind::Malformed,
    }
}

fn parse_ack(body: &str) -> SinkResponse {
    if body.trim().is_empty() {
        return SinkResponse::Ack;
    }
    let parsed: IngestResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Unparseable ingest response treated as ack: {}", e);
            return SinkResponse::Ack;
        }
    };
    if parsed.rejected.is_empty() {
        return SinkResponse::Ack;
    }
    let rejected = parsed
        .rejected
        .into_iter()
        .map(|r| {
            let kind = kind_for_code(r.code.as_deref());
            (r.index, SinkError::new(kind, r.message))
        })
        .collect();
    SinkResponse::PartialAck { rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::points;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&request).to_string()
        });

        (format!("http://{}/ingest", addr), handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(header_end) = text.find("\r\n\r\n") else {
            return false;
        };
        let content_length = text[..header_end]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    fn sink(endpoint: String) -> HttpSink {
        let config = HttpConfig {
            endpoint: Some(endpoint),
            token: Some("secret".to_string()),
        };
        HttpSink::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(kind_for_status(StatusCode::OK), None);
        assert_eq!(kind_for_status(StatusCode::ACCEPTED), None);
        assert_eq!(kind_for_status(StatusCode::TOO_MANY_REQUESTS), Some(SinkErrorKind::Throttled));
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), Some(SinkErrorKind::Unavailable));
        assert_eq!(kind_for_status(StatusCode::FORBIDDEN), Some(SinkErrorKind::Unauthorized));
        assert_eq!(kind_for_status(StatusCode::BAD_REQUEST), Some(SinkErrorKind::Malformed));
    }

    #[test]
    fn test_parse_partial_ack() {
        let body = r#"{"rejected":[{"index":2,"code":"invalid_dimension","message":"bad host"},{"index":4,"code":"throttled"}]}"#;
        match parse_ack(body) {
            SinkResponse::PartialAck { rejected } => {
                assert_eq!(rejected.len(), 2);
                assert_eq!(rejected[0].0, 2);
                assert_eq!(rejected[0].1.kind, SinkErrorKind::Malformed);
                assert_eq!(rejected[0].1.message, "bad host");
                assert_eq!(rejected[1].1.kind, SinkErrorKind::Throttled);
            }
            other => panic!("expected partial ack, got {:?}", other),
        }
        assert_eq!(parse_ack(""), SinkResponse::Ack);
        assert_eq!(parse_ack(r#"{"rejected":[]}"#), SinkResponse::Ack);
        assert_eq!(parse_ack("not json"), SinkResponse::Ack);
    }

    #[tokio::test]
    async fn test_put_sends_batch_payload() {
        let (endpoint, server) = serve_once("200 OK", "").await;
        let batch = points(3);

        let response = sink(endpoint).put("nvcw", &batch).await.unwrap();
        assert_eq!(response, SinkResponse::Ack);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /ingest"));
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
        assert!(request.contains(r#""namespace":"nvcw""#));
        assert_eq!(request.matches("metric_name").count(), 3);
    }

    #[tokio::test]
    async fn test_put_maps_throttling() {
        let (endpoint, server) = serve_once("429 Too Many Requests", r#"{"error":"slow down"}"#).await;

        let err = sink(endpoint).put("nvcw", &points(1)).await.unwrap_err();
        assert_eq!(err.kind, SinkErrorKind::Throttled);
        assert!(err.is_retryable());
        assert!(err.message.contains("slow down"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = sink(format!("http://{}/ingest", addr))
            .put("nvcw", &points(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
