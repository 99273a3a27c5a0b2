/*!
# nvcw DevKit - Stubs et Utilitaires pour Développement

Bibliothèque facilitant le test du pipeline nvcw avec:
- Source GPU simulée (sans driver NVIDIA)
- Sink de métriques en mémoire avec réponses scriptées
- Harness de test pour le scheduler complet
*/

pub mod hardware_stub;
pub mod sink_stub;
pub mod test_utils;

pub use hardware_stub::{sample_reading, FakeGpuSource};
pub use sink_stub::{MockMetricsSink, MockRequest, MockResponse};
pub use test_utils::{TestHarness, TestStats};
