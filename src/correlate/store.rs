//! In-memory incident store with key-scoped upsert serialization.
//!
//! The lookup-or-create-then-append sequence for a correlation key is
//! serialized through a per-key mutex, so bursts for the same key cannot
//! race into duplicate incidents while distinct keys proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use super::{CorrelateError, CorrelationKey, Incident, IncidentState};
use crate::decide::HealingPlan;
use crate::ingest::AnomalyEvent;

/// Thread-safe in-memory incident storage.
#[derive(Default)]
pub struct IncidentStore {
    incidents: RwLock<HashMap<Uuid, Incident>>,
    key_locks: Mutex<HashMap<CorrelationKey, Arc<Mutex<()>>>>,
}

/// Result of folding an event into the store.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// Snapshot of the incident after the event was applied.
    pub incident: Incident,
    /// True when a new incident was created rather than appended to.
    pub created: bool,
}

impl IncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn key_lock(&self, key: &CorrelationKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Fold an anomaly event into an existing open incident for its key, or
    /// create a new one.
    ///
    /// An incident qualifies when it is `open` or `mitigating` and its most
    /// recent contributing event lies within `window_sec` of the new
    /// event's timestamp.  Resolved incidents are never reused: a fresh
    /// event after resolution opens a new incident.
    pub async fn upsert_event(&self, event: AnomalyEvent, window_sec: u64) -> UpsertOutcome {
        let key = CorrelationKey::for_event(&event);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let window = Duration::seconds(window_sec as i64);
        let mut incidents = self.incidents.write().await;

        let existing = incidents.values_mut().find(|i| {
            i.key == key
                && !i.state.is_terminal()
                && (event.timestamp - i.last_event_at()).abs() <= window
        });

        if let Some(incident) = existing {
            incident.absorb(event);
            debug!(
                incident_id = %incident.incident_id,
                key = %incident.key,
                events = incident.events.len(),
                severity = ?incident.severity,
                "event correlated into existing incident"
            );
            return UpsertOutcome {
                incident: incident.clone(),
                created: false,
            };
        }

        let incident = Incident::new(event);
        info!(
            incident_id = %incident.incident_id,
            key = %incident.key,
            severity = ?incident.severity,
            "incident opened"
        );
        incidents.insert(incident.incident_id, incident.clone());
        UpsertOutcome {
            incident,
            created: true,
        }
    }

    /// Snapshot of one incident.
    pub async fn get(&self, id: Uuid) -> Option<Incident> {
        self.incidents.read().await.get(&id).cloned()
    }

    /// Current lifecycle state of one incident.
    pub async fn state(&self, id: Uuid) -> Option<IncidentState> {
        self.incidents.read().await.get(&id).map(|i| i.state)
    }

    /// All incidents, newest first.
    pub async fn list(&self) -> Vec<Incident> {
        let mut all: Vec<Incident> = self.incidents.read().await.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }

    /// Apply a mutation to a live (non-terminal) incident.
    ///
    /// Terminal incidents are immutable; attempting to mutate one is an
    /// invalid-transition error.
    pub async fn with_mut<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Incident) -> T,
    ) -> Result<T, CorrelateError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(CorrelateError::NotFound(id))?;
        if incident.state.is_terminal() {
            return Err(CorrelateError::InvalidTransition {
                from: incident.state,
                to: incident.state,
            });
        }
        incident.updated_at = Utc::now();
        Ok(f(incident))
    }

    /// Move an incident through the lifecycle state machine.
    pub async fn transition(
        &self,
        id: Uuid,
        to: IncidentState,
    ) -> Result<Incident, CorrelateError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(CorrelateError::NotFound(id))?;
        if !incident.state.can_transition_to(to) {
            return Err(CorrelateError::InvalidTransition {
                from: incident.state,
                to,
            });
        }
        info!(incident_id = %id, from = %incident.state, to = %to, "incident transition");
        incident.state = to;
        incident.updated_at = Utc::now();
        if to.is_terminal() {
            incident.active_plan = None;
        }
        Ok(incident.clone())
    }

    /// Atomically attach a plan and mark the incident `mitigating`.
    ///
    /// This is the serialization point for the at-most-one-active-plan
    /// invariant: of two decision cycles racing to attach, exactly one
    /// succeeds.
    pub async fn try_attach_plan(
        &self,
        id: Uuid,
        plan: HealingPlan,
    ) -> Result<Incident, CorrelateError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(CorrelateError::NotFound(id))?;
        if incident.active_plan.is_some() {
            return Err(CorrelateError::PlanAlreadyActive(id));
        }
        if !incident.state.can_transition_to(IncidentState::Mitigating) {
            return Err(CorrelateError::InvalidTransition {
                from: incident.state,
                to: IncidentState::Mitigating,
            });
        }
        incident.state = IncidentState::Mitigating;
        incident.updated_at = Utc::now();
        incident.attempts += 1;
        incident
            .attempted_actions
            .extend(plan.actions.iter().map(|a| a.action_type));
        incident.active_plan = Some(plan);
        Ok(incident.clone())
    }

    /// Clear a concluded plan, keeping the incident in `mitigating` until
    /// the outcome handler decides where it goes next.  Terminal incidents
    /// already dropped their plan and stay untouched.
    pub async fn detach_plan(&self, id: Uuid) -> Result<(), CorrelateError> {
        let mut incidents = self.incidents.write().await;
        let incident = incidents.get_mut(&id).ok_or(CorrelateError::NotFound(id))?;
        if incident.state.is_terminal() {
            return Ok(());
        }
        incident.active_plan = None;
        incident.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decide::{Action, ActionType, AutonomyRequirement, RiskTier};
    use crate::ingest::{AnomalyType, Severity, ThresholdDirection};
    use chrono::{DateTime, Utc};

    fn event(id: &str, service: &str, at: DateTime<Utc>, severity: Severity) -> AnomalyEvent {
        AnomalyEvent {
            event_id: id.to_string(),
            timestamp: at,
            source: "monitoring".to_string(),
            anomaly_type: AnomalyType::ErrorRateSpike,
            severity,
            target_service: service.to_string(),
            target_namespace: "default".to_string(),
            metric_name: "error_rate".to_string(),
            current_value: 10.0,
            threshold_value: 5.0,
            threshold_direction: ThresholdDirection::Above,
            window_seconds: 60,
            context: Default::default(),
        }
    }

    fn plan_for(incident_id: Uuid) -> HealingPlan {
        HealingPlan {
            plan_id: Uuid::new_v4(),
            incident_id,
            actions: vec![Action {
                action_id: Uuid::new_v4(),
                action_type: ActionType::ScaleOut,
                target: "default/payment-service".to_string(),
                parameters: serde_json::json!({"increment": 1}),
                expected_outcome: "load spread over more replicas".to_string(),
                blast_fraction: 0.2,
            }],
            confidence: 0.8,
            risk: RiskTier::Low,
            autonomy: AutonomyRequirement::AutoExecute,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_events_within_window_merge() {
        let store = IncidentStore::new();
        let now = Utc::now();

        let a = store.upsert_event(event("e1", "svc-a", now, Severity::High), 300).await;
        assert!(a.created);

        let b = store
            .upsert_event(
                event("e2", "svc-a", now + Duration::seconds(30), Severity::Medium),
                300,
            )
            .await;
        assert!(!b.created);
        assert_eq!(a.incident.incident_id, b.incident.incident_id);
        assert_eq!(b.incident.events.len(), 2);
    }

    #[tokio::test]
    async fn test_events_outside_window_split() {
        let store = IncidentStore::new();
        let now = Utc::now();

        let a = store.upsert_event(event("e1", "svc-a", now, Severity::High), 300).await;
        let b = store
            .upsert_event(
                event("e2", "svc-a", now + Duration::seconds(301), Severity::High),
                300,
            )
            .await;
        assert!(b.created);
        assert_ne!(a.incident.incident_id, b.incident.incident_id);
    }

    #[tokio::test]
    async fn test_different_services_split() {
        let store = IncidentStore::new();
        let now = Utc::now();

        let a = store.upsert_event(event("e1", "svc-a", now, Severity::High), 300).await;
        let b = store.upsert_event(event("e2", "svc-b", now, Severity::High), 300).await;
        assert!(b.created);
        assert_ne!(a.incident.incident_id, b.incident.incident_id);
    }

    #[tokio::test]
    async fn test_severity_is_monotonic_max() {
        let store = IncidentStore::new();
        let now = Utc::now();

        let a = store.upsert_event(event("e1", "svc-a", now, Severity::High), 300).await;
        assert_eq!(a.incident.severity, Severity::High);

        // A lower-severity event must not lower the incident severity.
        let b = store
            .upsert_event(
                event("e2", "svc-a", now + Duration::seconds(5), Severity::Low),
                300,
            )
            .await;
        assert_eq!(b.incident.severity, Severity::High);

        let c = store
            .upsert_event(
                event("e3", "svc-a", now + Duration::seconds(10), Severity::Critical),
                300,
            )
            .await;
        assert_eq!(c.incident.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_resolved_incident_never_reused() {
        let store = IncidentStore::new();
        let now = Utc::now();

        let a = store.upsert_event(event("e1", "svc-a", now, Severity::High), 300).await;
        let id = a.incident.incident_id;
        store.transition(id, IncidentState::Mitigating).await.unwrap();
        store.transition(id, IncidentState::Resolved).await.unwrap();

        let b = store
            .upsert_event(
                event("e2", "svc-a", now + Duration::seconds(5), Severity::High),
                300,
            )
            .await;
        assert!(b.created, "fresh event after resolution opens a new incident");
        assert_ne!(b.incident.incident_id, id);

        // The resolved record itself is untouched.
        let resolved = store.get(id).await.unwrap();
        assert_eq!(resolved.state, IncidentState::Resolved);
        assert_eq!(resolved.events.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_incident_rejects_mutation() {
        let store = IncidentStore::new();
        let a = store
            .upsert_event(event("e1", "svc-a", Utc::now(), Severity::High), 300)
            .await;
        let id = a.incident.incident_id;
        store.transition(id, IncidentState::Escalated).await.unwrap();

        let result = store.with_mut(id, |i| i.attempts += 1).await;
        assert!(matches!(
            result,
            Err(CorrelateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_plan_under_contention() {
        let store = Arc::new(IncidentStore::new());
        let a = store
            .upsert_event(event("e1", "svc-a", Utc::now(), Severity::High), 300)
            .await;
        let id = a.incident.incident_id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_attach_plan(id, plan_for(id)).await.is_ok()
            }));
        }

        let mut attached = 0;
        for h in handles {
            if h.await.unwrap() {
                attached += 1;
            }
        }
        assert_eq!(attached, 1, "exactly one racing cycle may attach a plan");

        let incident = store.get(id).await.unwrap();
        assert_eq!(incident.state, IncidentState::Mitigating);
        assert_eq!(incident.attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_key_single_incident() {
        let store = Arc::new(IncidentStore::new());
        let now = Utc::now();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let e = event(&format!("e{i}"), "svc-a", now, Severity::Medium);
            handles.push(tokio::spawn(async move {
                store.upsert_event(e, 300).await.incident.incident_id
            }));
        }

        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        ids.dedup();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 1, "burst for one key collapses into one incident");

        let incident = store.get(ids[0]).await.unwrap();
        assert_eq!(incident.events.len(), 16);
    }
}
