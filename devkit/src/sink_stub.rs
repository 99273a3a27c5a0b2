/*!
Mock Metrics Sink pour développement sans backend

Remplace le broker MQTT ou l'endpoint HTTP dans les tests du pipeline.
Enregistre toutes les requêtes reçues et répond selon un script.
*/

use async_trait::async_trait;
use nvcw_agent::error::{SinkError, SinkErrorKind};
use nvcw_agent::sink::{BatchPayload, MetricsSink, SinkResponse};
use nvcw_agent::MetricPoint;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Une requête reçue par le sink
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub namespace: String,
    pub points: Vec<MetricPoint>,
}

impl MockRequest {
    /// Corps JSON tel qu'un vrai transport l'aurait envoyé
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(BatchPayload {
            namespace: &self.namespace,
            metric_data: &self.points,
        })
    }
}

/// Réponse scriptée
#[derive(Debug, Clone)]
pub enum MockResponse {
    Ack,
    /// Rejette les points aux positions données, accepte le reste
    Reject(Vec<(usize, SinkError)>),
    Fail(SinkError),
    /// Répond `Ack` après un délai
    Delay(Duration),
}

/// Mock Sink qui simule un backend de métriques
#[derive(Clone, Default)]
pub struct MockMetricsSink {
    requests: Arc<Mutex<Vec<MockRequest>>>,
    script: Arc<Mutex<VecDeque<MockResponse>>>,
    closes: Arc<AtomicUsize>,
}

impl MockMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute une réponse au script; sans script le sink répond `Ack`
    pub fn push_response(&self, response: MockResponse) -> &Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    /// Les `count` prochaines requêtes échouent avec `kind`
    pub fn fail_next(&self, count: usize, kind: SinkErrorKind) -> &Self {
        for _ in 0..count {
            self.push_response(MockResponse::Fail(SinkError::new(kind, "scripted failure")));
        }
        self
    }

    /// Récupère toutes les requêtes reçues (pour assertions de tests)
    pub fn get_requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Tous les points reçus, dans l'ordre d'arrivée
    pub fn received_points(&self) -> Vec<MetricPoint> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .flat_map(|request| request.points.iter().cloned())
            .collect()
    }

    /// Trouve les points reçus pour une métrique donnée
    pub fn find_points_by_name(&self, name: &str) -> Vec<MetricPoint> {
        self.received_points()
            .into_iter()
            .filter(|point| point.name() == name)
            .collect()
    }

    /// Nombre d'appels à `close`
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Reset les requêtes et le script
    pub fn clear(&self) {
        self.requests.lock().unwrap().clear();
        self.script.lock().unwrap().clear();
    }
}

#[async_trait]
impl MetricsSink for MockMetricsSink {
    async fn put(&self, namespace: &str, points: &[MetricPoint]) -> Result<SinkResponse, SinkError> {
        self.requests.lock().unwrap().push(MockRequest {
            namespace: namespace.to_string(),
            points: points.to_vec(),
        });
        log::info!("📤 [MOCK] {} points for namespace {}", points.len(), namespace);

        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or(MockResponse::Ack) {
            MockResponse::Ack => Ok(SinkResponse::Ack),
            MockResponse::Reject(rejected) => {
                log::info!("⚠️ [MOCK] Rejecting {} points", rejected.len());
                Ok(SinkResponse::PartialAck { rejected })
            }
            MockResponse::Fail(err) => {
                log::info!("❌ [MOCK] Failing request: {}", err);
                Err(err)
            }
            MockResponse::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(SinkResponse::Ack)
            }
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        log::info!("🔌 [MOCK] Sink closed");
    }
}
