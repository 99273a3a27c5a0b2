//! Host identity for the `host` dimension
//!
//! The label comes from configuration when present, otherwise from the
//! machine hostname.

use tracing::{debug, warn};

/// Trimmed label, `None` when blank
pub fn normalize_label(label: &str) -> Option<String> {
    let label = label.trim();
    (!label.is_empty()).then(|| label.to_string())
}

/// Machine hostname, `None` when the OS reports nothing usable
pub fn detect_hostname() -> Option<String> {
    let hostname = gethostname::gethostname();
    match normalize_label(&hostname.to_string_lossy()) {
        Some(label) => {
            debug!(hostname = %label, "Detected hostname");
            Some(label)
        }
        None => {
            warn!("Hostname detection returned an empty name");
            None
        }
    }
}
