//! Incident correlation and lifecycle.
//!
//! Groups anomaly events into incidents by (service, namespace, anomaly
//! category) within a time window, owns the incident state machine, and
//! drives the decision cycle on every qualifying event or execution
//! outcome.

pub mod engine;
pub mod store;

pub use engine::CorrelationEngine;
pub use store::IncidentStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::decide::HealingPlan;
use crate::ingest::{AnomalyEvent, Severity};

// ---------------------------------------------------------------------------
// CorrelationKey
// ---------------------------------------------------------------------------

/// Grouping key for incident correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CorrelationKey {
    pub service: String,
    pub namespace: String,
    pub category: String,
}

impl CorrelationKey {
    pub fn for_event(event: &AnomalyEvent) -> Self {
        Self {
            service: event.target_service.clone(),
            namespace: event.target_namespace.clone(),
            category: event.anomaly_type.category().to_string(),
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.service, self.category)
    }
}

// ---------------------------------------------------------------------------
// IncidentState
// ---------------------------------------------------------------------------

/// Incident lifecycle.
///
/// `Resolved` and `Escalated` are terminal: a resolved incident is never
/// mutated again; a later event for the same key opens a *new* incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentState {
    Open,
    Mitigating,
    Resolved,
    Escalated,
}

impl IncidentState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentState::Resolved | IncidentState::Escalated)
    }

    /// Allowed transitions.  `Mitigating -> Open` is the retry path after
    /// a plan concludes without resolving the incident.
    pub fn can_transition_to(self, next: IncidentState) -> bool {
        use IncidentState::*;
        matches!(
            (self, next),
            (Open, Mitigating)
                | (Open, Escalated)
                | (Mitigating, Open)
                | (Mitigating, Resolved)
                | (Mitigating, Escalated)
        )
    }
}

impl std::fmt::Display for IncidentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IncidentState::Open => "open",
            IncidentState::Mitigating => "mitigating",
            IncidentState::Resolved => "resolved",
            IncidentState::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Incident
// ---------------------------------------------------------------------------

/// A correlated, deduplicated aggregate of one or more anomaly events
/// representing one ongoing problem.
///
/// Owned exclusively by the correlation engine; other components receive
/// snapshots and never mutate.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub key: CorrelationKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Maximum severity across contributing events; never decreases while
    /// the incident is open.
    pub severity: Severity,
    pub state: IncidentState,
    /// Contributing events in arrival order.
    pub events: Vec<AnomalyEvent>,
    /// At most one plan is active per incident at any time.
    pub active_plan: Option<HealingPlan>,
    /// Remediation attempts consumed (dispatched or rejected plans).
    pub attempts: u32,
    /// Action types already tried for this incident, in order.
    pub attempted_actions: Vec<crate::decide::ActionType>,
}

impl Incident {
    pub fn new(event: AnomalyEvent) -> Self {
        let now = Utc::now();
        Self {
            incident_id: Uuid::new_v4(),
            key: CorrelationKey::for_event(&event),
            created_at: now,
            updated_at: now,
            severity: event.severity,
            state: IncidentState::Open,
            events: vec![event],
            active_plan: None,
            attempts: 0,
            attempted_actions: Vec::new(),
        }
    }

    /// Timestamp of the most recent contributing event.
    pub fn last_event_at(&self) -> DateTime<Utc> {
        self.events
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or(self.created_at)
    }

    /// Fold a new contributing event into this incident.
    pub(crate) fn absorb(&mut self, event: AnomalyEvent) {
        self.severity = self.severity.max(event.severity);
        self.updated_at = Utc::now();
        self.events.push(event);
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error("incident {0} not found")]
    NotFound(Uuid),
    #[error("invalid incident transition {from} -> {to}")]
    InvalidTransition {
        from: IncidentState,
        to: IncidentState,
    },
    #[error("incident {0} already has an active plan")]
    PlanAlreadyActive(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(IncidentState::Resolved.is_terminal());
        assert!(IncidentState::Escalated.is_terminal());
        assert!(!IncidentState::Open.is_terminal());
        assert!(!IncidentState::Mitigating.is_terminal());
    }

    #[test]
    fn test_transition_table() {
        use IncidentState::*;
        assert!(Open.can_transition_to(Mitigating));
        assert!(Open.can_transition_to(Escalated));
        assert!(Mitigating.can_transition_to(Resolved));
        assert!(Mitigating.can_transition_to(Escalated));
        assert!(Mitigating.can_transition_to(Open));

        // Terminal states never move.
        assert!(!Resolved.can_transition_to(Open));
        assert!(!Resolved.can_transition_to(Mitigating));
        assert!(!Escalated.can_transition_to(Open));
        // No self-loop or skip transitions.
        assert!(!Open.can_transition_to(Open));
        assert!(!Open.can_transition_to(Resolved));
    }
}
