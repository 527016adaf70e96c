//! Anomaly event ingestion -- validation, normalization, and dedup.
//!
//! The [`IngestGateway`] is the only entry point for anomaly events.  It
//! validates required fields and value ranges, deduplicates by event
//! identifier (duplicate submission is an idempotent no-op), and forwards
//! accepted events to the correlation engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::audit::{AuditEmitter, AuditPhase, AuditRecord};
use crate::correlate::CorrelationEngine;

// ---------------------------------------------------------------------------
// Event contract types
// ---------------------------------------------------------------------------

/// Severity levels for anomaly events and incidents.
///
/// Variant order matters: incident severity is the maximum across
/// contributing events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric weight used for recency-weighted ranking.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 1.0,
            Severity::Medium => 2.0,
            Severity::High => 3.0,
            Severity::Critical => 4.0,
        }
    }
}

/// Kinds of anomalies reported by upstream detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    ErrorRateSpike,
    LatencySpike,
    CpuOverload,
    MemoryOverload,
    PodCrashLoop,
    DeploymentFailure,
    HealthCheckFailure,
}

impl AnomalyType {
    /// Correlation bucket.  Anomalies in the same bucket against the same
    /// service and namespace collapse into one incident.
    pub fn category(&self) -> &'static str {
        match self {
            AnomalyType::ErrorRateSpike => "errors",
            AnomalyType::LatencySpike => "latency",
            AnomalyType::CpuOverload | AnomalyType::MemoryOverload => "resources",
            AnomalyType::PodCrashLoop | AnomalyType::DeploymentFailure => "workload",
            AnomalyType::HealthCheckFailure => "availability",
        }
    }

    /// Stable label used for hypotheses and audit payloads.
    pub fn label(&self) -> &'static str {
        match self {
            AnomalyType::ErrorRateSpike => "error_rate_spike",
            AnomalyType::LatencySpike => "latency_spike",
            AnomalyType::CpuOverload => "cpu_overload",
            AnomalyType::MemoryOverload => "memory_overload",
            AnomalyType::PodCrashLoop => "pod_crash_loop",
            AnomalyType::DeploymentFailure => "deployment_failure",
            AnomalyType::HealthCheckFailure => "health_check_failure",
        }
    }
}

/// Which side of the threshold the metric crossed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    #[default]
    Above,
    Below,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_window_seconds() -> u32 {
    60
}

/// A single reported deviation of a metric from its threshold.
///
/// Immutable once accepted; the event identifier is globally unique and
/// duplicate ingestion has no incident effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub target_service: String,
    #[serde(default = "default_namespace")]
    pub target_namespace: String,
    pub metric_name: String,
    pub current_value: f64,
    pub threshold_value: f64,
    #[serde(default)]
    pub threshold_direction: ThresholdDirection,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u32,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Rejection reasons for malformed anomaly submissions.
///
/// A rejected event creates no state anywhere in the pipeline.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("required field is empty: {0}")]
    EmptyField(&'static str),
    #[error("{field} must be non-negative, got {value}")]
    NegativeValue { field: &'static str, value: f64 },
    #[error("{field} must be finite, got {value}")]
    NonFiniteValue { field: &'static str, value: f64 },
    #[error("window_seconds must be greater than zero")]
    ZeroWindow,
}

fn validate(event: &AnomalyEvent) -> Result<(), ValidationError> {
    if event.event_id.trim().is_empty() {
        return Err(ValidationError::EmptyField("event_id"));
    }
    if event.source.trim().is_empty() {
        return Err(ValidationError::EmptyField("source"));
    }
    if event.target_service.trim().is_empty() {
        return Err(ValidationError::EmptyField("target_service"));
    }
    if event.target_namespace.trim().is_empty() {
        return Err(ValidationError::EmptyField("target_namespace"));
    }
    if event.metric_name.trim().is_empty() {
        return Err(ValidationError::EmptyField("metric_name"));
    }
    for (field, value) in [
        ("current_value", event.current_value),
        ("threshold_value", event.threshold_value),
    ] {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { field, value });
        }
        if value < 0.0 {
            return Err(ValidationError::NegativeValue { field, value });
        }
    }
    if event.window_seconds == 0 {
        return Err(ValidationError::ZeroWindow);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// IngestGateway
// ---------------------------------------------------------------------------

/// Response returned for an accepted (or idempotently repeated) submission.
#[derive(Debug, Clone, Serialize)]
pub struct Acceptance {
    pub event_id: String,
    /// The incident this event contributed to.  `None` only when a
    /// duplicate races the original submission before attribution settles.
    pub incident_id: Option<Uuid>,
    pub duplicate: bool,
}

/// Entry point for anomaly events: validate, deduplicate, forward.
pub struct IngestGateway {
    engine: Arc<CorrelationEngine>,
    audit: Arc<AuditEmitter>,
    /// event_id -> incident the event was attributed to.  `None` marks a
    /// submission still in flight, so concurrent duplicates stay no-ops.
    seen: Mutex<HashMap<String, Option<Uuid>>>,
}

impl IngestGateway {
    pub fn new(engine: Arc<CorrelationEngine>, audit: Arc<AuditEmitter>) -> Self {
        Self {
            engine,
            audit,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Submit one anomaly event.
    ///
    /// Malformed input is rejected with [`ValidationError`] and creates no
    /// partial state.  A previously seen event identifier is a no-op
    /// success.
    pub async fn submit(&self, event: AnomalyEvent) -> Result<Acceptance, ValidationError> {
        validate(&event)?;

        // Reserve the event id before forwarding so a racing duplicate
        // cannot contribute twice.
        {
            let mut seen = self.seen.lock().await;
            if let Some(attributed) = seen.get(&event.event_id) {
                debug!(event_id = %event.event_id, "duplicate event ignored");
                return Ok(Acceptance {
                    event_id: event.event_id.clone(),
                    incident_id: *attributed,
                    duplicate: true,
                });
            }
            seen.insert(event.event_id.clone(), None);
        }

        let event_id = event.event_id.clone();
        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Observe,
                &event_id,
                serde_json::json!({
                    "kind": "event_accepted",
                    "anomaly_type": event.anomaly_type.label(),
                    "severity": event.severity,
                    "target_service": event.target_service,
                    "target_namespace": event.target_namespace,
                    "metric_name": event.metric_name,
                }),
            ))
            .await;

        let incident_id = self.engine.ingest(event).await;
        self.seen
            .lock()
            .await
            .insert(event_id.clone(), Some(incident_id));

        Ok(Acceptance {
            event_id,
            incident_id: Some(incident_id),
            duplicate: false,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
