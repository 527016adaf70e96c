//! Orientation: turn an incident's contributing events into ranked
//! root-cause hypotheses.
//!
//! Stateless and read-only with respect to the incident; recomputed fresh
//! on every decision cycle because incident context changes as events
//! arrive.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::correlate::Incident;
use crate::ingest::AnomalyType;

/// Half-life of the recency weighting applied to event severity.
const RECENCY_HALF_LIFE_SEC: f64 = 300.0;

/// A root-cause candidate with supporting evidence.
#[derive(Debug, Clone, Serialize)]
pub struct Hypothesis {
    /// Root-cause category label (anomaly type label).
    pub category: String,
    /// Event identifiers supporting this hypothesis.
    pub evidence: Vec<String>,
    /// Confidence in [0, 1].
    pub confidence: f64,
}

/// Rank hypotheses for an incident.
///
/// Primary sort: supporting-evidence count, descending.  Secondary:
/// recency-weighted severity, descending.  Ties break by lexical category
/// order so identical inputs always rank identically.
pub fn rank(incident: &Incident, now: DateTime<Utc>) -> Vec<Hypothesis> {
    struct Bucket {
        anomaly_type: AnomalyType,
        evidence: Vec<String>,
        weighted_severity: f64,
        peak_weight: f64,
    }

    let mut buckets: Vec<Bucket> = Vec::new();
    for event in &incident.events {
        let age_sec = (now - event.timestamp).num_seconds().max(0) as f64;
        let recency = 0.5_f64.powf(age_sec / RECENCY_HALF_LIFE_SEC);
        let contribution = event.severity.weight() * recency;

        match buckets
            .iter_mut()
            .find(|b| b.anomaly_type == event.anomaly_type)
        {
            Some(bucket) => {
                bucket.evidence.push(event.event_id.clone());
                bucket.weighted_severity += contribution;
                bucket.peak_weight = bucket.peak_weight.max(event.severity.weight());
            }
            None => buckets.push(Bucket {
                anomaly_type: event.anomaly_type,
                evidence: vec![event.event_id.clone()],
                weighted_severity: contribution,
                peak_weight: event.severity.weight(),
            }),
        }
    }

    buckets.sort_by(|a, b| {
        b.evidence
            .len()
            .cmp(&a.evidence.len())
            .then(
                b.weighted_severity
                    .partial_cmp(&a.weighted_severity)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.anomaly_type.label().cmp(b.anomaly_type.label()))
    });

    buckets
        .into_iter()
        .map(|b| {
            let confidence = confidence_for(b.evidence.len(), b.peak_weight);
            Hypothesis {
                category: b.anomaly_type.label().to_string(),
                evidence: b.evidence,
                confidence,
            }
        })
        .collect()
}

/// Confidence grows with corroborating evidence and peak severity, capped
/// below certainty.
fn confidence_for(evidence_count: usize, peak_severity_weight: f64) -> f64 {
    let base = 0.35 + 0.15 * (evidence_count.min(4) as f64) + 0.05 * peak_severity_weight;
    base.clamp(0.0, 0.95)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
