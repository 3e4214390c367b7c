//! Structured logging initialization and extension health snapshots.

#![warn(missing_docs, clippy::pedantic)]

use serde::{Deserialize, Serialize};
use tracing::Span;
use yodoca_primitives::ExtensionId;

/// Initializes the global `tracing` subscriber for the agent process.
///
/// Reads the standard `RUST_LOG` filter, defaulting to `info` when unset.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Returns a namespaced logging span for an extension, `ext.<id>`.
///
/// Extension code is expected to `let _guard = logger_span(id).entered();` (or
/// log directly against the returned span) so every line it emits carries the
/// extension id.
#[must_use]
pub fn logger_span(extension_id: &ExtensionId) -> Span {
    tracing::info_span!("extension", id = %extension_id)
}

/// Outcome of a single extension health check, recorded by the loader's
/// 30-second health monitor loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Extension the snapshot covers.
    pub extension_id: String,
    /// Whether `health_check()` returned `true` (or did not panic/error).
    pub healthy: bool,
    /// Optional detail, populated on failure.
    pub detail: Option<String>,
}

impl HealthSnapshot {
    /// Creates a healthy snapshot.
    #[must_use]
    pub fn healthy(extension_id: &ExtensionId) -> Self {
        Self {
            extension_id: extension_id.as_str().to_owned(),
            healthy: true,
            detail: None,
        }
    }

    /// Creates an unhealthy snapshot carrying a human-readable detail.
    #[must_use]
    pub fn unhealthy(extension_id: &ExtensionId, detail: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.as_str().to_owned(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_constructors_set_expected_fields() {
        let id = ExtensionId::new("telegram").unwrap();
        let healthy = HealthSnapshot::healthy(&id);
        assert!(healthy.healthy);
        assert!(healthy.detail.is_none());

        let unhealthy = HealthSnapshot::unhealthy(&id, "timed out");
        assert!(!unhealthy.healthy);
        assert_eq!(unhealthy.detail.as_deref(), Some("timed out"));
    }
}
