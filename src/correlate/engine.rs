//! The correlation engine: event-driven heart of the remediation loop.
//!
//! Every qualifying anomaly event or execution outcome triggers exactly
//! one decision cycle for its incident: orient the contributing events
//! into hypotheses, decide on a plan, pass it through the safety governor,
//! and hand an approved plan to the execution coordinator off the
//! correlation path.  There is no polling loop anywhere.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::store::IncidentStore;
use super::{CorrelateError, Incident, IncidentState};
use crate::audit::{AuditEmitter, AuditPhase, AuditRecord};
use crate::config::CorrelationConfig;
use crate::decide::{DecisionEngine, DecisionError, HealingPlan};
use crate::execute::{ExecutionCoordinator, PlanOutcome, PlanReport};
use crate::govern::SafetyGovernor;
use crate::ingest::AnomalyEvent;
use crate::orient;

/// Owns the incident lifecycle and drives decision cycles.
pub struct CorrelationEngine {
    store: Arc<IncidentStore>,
    decider: DecisionEngine,
    governor: Arc<SafetyGovernor>,
    coordinator: Arc<ExecutionCoordinator>,
    audit: Arc<AuditEmitter>,
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(
        store: Arc<IncidentStore>,
        decider: DecisionEngine,
        governor: Arc<SafetyGovernor>,
        coordinator: Arc<ExecutionCoordinator>,
        audit: Arc<AuditEmitter>,
        config: CorrelationConfig,
    ) -> Self {
        Self {
            store,
            decider,
            governor,
            coordinator,
            audit,
            config,
        }
    }

    pub fn store(&self) -> &Arc<IncidentStore> {
        &self.store
    }

    /// Fold a validated anomaly event into its incident and, when no plan
    /// is already in flight, run a decision cycle.
    pub async fn ingest(self: &Arc<Self>, event: AnomalyEvent) -> Uuid {
        let outcome = self
            .store
            .upsert_event(event, self.config.correlation_window_sec)
            .await;
        let incident = outcome.incident;
        let incident_id = incident.incident_id;

        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Observe,
                incident_id.to_string(),
                serde_json::json!({
                    "kind": if outcome.created { "incident_created" } else { "incident_updated" },
                    "key": incident.key,
                    "severity": incident.severity,
                    "events": incident.events.len(),
                }),
            ))
            .await;

        // Re-trigger only when nothing is mid-flight for this incident.
        if incident.state == IncidentState::Open && incident.active_plan.is_none() {
            self.run_cycle(incident_id).await;
        }
        incident_id
    }

    /// One observe-orient-decide-act cycle for an incident.
    pub async fn run_cycle(self: &Arc<Self>, incident_id: Uuid) {
        let Some(incident) = self.store.get(incident_id).await else {
            return;
        };
        if incident.state != IncidentState::Open || incident.active_plan.is_some() {
            return;
        }
        if incident.attempts >= self.config.max_attempts {
            self.escalate(incident_id, "remediation attempt budget exhausted")
                .await;
            return;
        }

        // Hypotheses are recomputed fresh every cycle; the incident context keeps changing.
        let hypotheses = orient::rank(&incident, Utc::now());
        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Orient,
                incident_id.to_string(),
                serde_json::json!({
                    "kind": "hypotheses_ranked",
                    "hypotheses": hypotheses,
                }),
            ))
            .await;

        // Pick the next candidate action.
        let plan = match self.decider.decide(&incident, &hypotheses) {
            Ok(plan) => plan,
            Err(e @ DecisionError::CandidatesExhausted { .. }) => {
                self.audit
                    .emit(AuditRecord::new(
                        AuditPhase::Decide,
                        incident_id.to_string(),
                        serde_json::json!({"kind": "no_viable_plan", "reason": e.to_string()}),
                    ))
                    .await;
                self.escalate(incident_id, "every candidate action attempted or rejected")
                    .await;
                return;
            }
            Err(e) => {
                // Abstained: the incident stays open and the next
                // qualifying event retries.
                debug!(incident_id = %incident_id, reason = %e, "decision engine abstained");
                self.audit
                    .emit(AuditRecord::new(
                        AuditPhase::Decide,
                        incident_id.to_string(),
                        serde_json::json!({"kind": "no_viable_plan", "reason": e.to_string()}),
                    ))
                    .await;
                return;
            }
        };

        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Decide,
                plan.plan_id.to_string(),
                serde_json::json!({
                    "kind": "plan_proposed",
                    "incident_id": incident_id,
                    "actions": plan.actions,
                    "confidence": plan.confidence,
                    "risk": plan.risk,
                }),
            ))
            .await;

        // Governor check-and-reserve is atomic with respect to the cap.
        if let Err(violation) = self.governor.approve(&plan).await {
            warn!(
                incident_id = %incident_id,
                plan_id = %plan.plan_id,
                reason = %violation,
                "plan rejected by safety governor"
            );
            self.audit
                .emit(AuditRecord::new(
                    AuditPhase::Decide,
                    plan.plan_id.to_string(),
                    serde_json::json!({
                        "kind": "plan_rejected",
                        "incident_id": incident_id,
                        "code": violation.code(),
                        "reason": violation.to_string(),
                    }),
                ))
                .await;
            // Consume the attempt and remember the candidate so the next
            // cycle moves on to the next one.
            let plan_actions: Vec<_> = plan.actions.iter().map(|a| a.action_type).collect();
            let _ = self
                .store
                .with_mut(incident_id, |i| {
                    i.attempts += 1;
                    i.attempted_actions.extend(plan_actions);
                })
                .await;
            return;
        }

        // Attaching the plan is the at-most-one-plan serialization
        // point; the loser of a race hands its execution slot back.
        match self.store.try_attach_plan(incident_id, plan.clone()).await {
            Ok(_) => {
                info!(
                    incident_id = %incident_id,
                    plan_id = %plan.plan_id,
                    "plan approved and dispatched"
                );
                self.audit
                    .emit(AuditRecord::new(
                        AuditPhase::Act,
                        plan.plan_id.to_string(),
                        serde_json::json!({
                            "kind": "plan_approved",
                            "incident_id": incident_id,
                        }),
                    ))
                    .await;
                self.spawn_execution(plan);
            }
            Err(e) => {
                self.governor.surrender().await;
                debug!(incident_id = %incident_id, reason = %e, "plan attach lost the race");
            }
        }
    }

    /// Run the plan on a detached task so ingestion never blocks on an
    /// in-flight remediation.
    fn spawn_execution(self: &Arc<Self>, plan: HealingPlan) {
        let engine = self.clone();
        tokio::spawn(async move {
            let report = engine.coordinator.run_plan(&plan).await;
            engine.on_outcome(&plan, report).await;
        });
    }

    /// Feed an execution outcome back into the incident lifecycle.
    async fn on_outcome(self: &Arc<Self>, plan: &HealingPlan, report: PlanReport) {
        self.governor.release(plan.target()).await;
        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Outcome,
                plan.plan_id.to_string(),
                serde_json::json!({
                    "kind": "plan_outcome",
                    "incident_id": plan.incident_id,
                    "outcome": report.outcome,
                    "actions": report.actions,
                }),
            ))
            .await;
        let _ = self.store.detach_plan(plan.incident_id).await;

        match report.outcome {
            PlanOutcome::Succeeded => self.begin_observation(plan.incident_id).await,
            PlanOutcome::Cancelled => {
                // Closed out from under the plan; nothing further to drive.
            }
            PlanOutcome::Failed | PlanOutcome::TimedOut => {
                let Some(incident) = self.store.get(plan.incident_id).await else {
                    return;
                };
                if incident.state.is_terminal() {
                    return;
                }
                if incident.attempts >= self.config.max_attempts {
                    self.escalate(plan.incident_id, "execution failed and attempt budget exhausted")
                        .await;
                } else {
                    // An execution outcome is a qualifying trigger: go back
                    // to open and decide the next attempt now.
                    match self
                        .store
                        .transition(plan.incident_id, IncidentState::Open)
                        .await
                    {
                        Ok(_) => self.run_cycle(plan.incident_id).await,
                        Err(e) => debug!(error = %e, "retry transition skipped"),
                    }
                }
            }
        }
    }

    /// Hold the incident in `mitigating` for the observation window; only
    /// resolve if no new qualifying event arrived, so a remediation that
    /// did not actually fix the issue cannot close the incident.
    async fn begin_observation(self: &Arc<Self>, incident_id: Uuid) {
        let marker = Utc::now();
        let window = Duration::from_secs(self.config.observation_window_sec);
        let engine = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            engine.finish_observation(incident_id, marker).await;
        });
    }

    async fn finish_observation(self: &Arc<Self>, incident_id: Uuid, marker: DateTime<Utc>) {
        let Some(incident) = self.store.get(incident_id).await else {
            return;
        };
        if incident.state != IncidentState::Mitigating || incident.active_plan.is_some() {
            return;
        }

        if incident.last_event_at() > marker {
            info!(
                incident_id = %incident_id,
                "new anomalies during observation window; remediation did not stick"
            );
            match self
                .store
                .transition(incident_id, IncidentState::Open)
                .await
            {
                Ok(_) => self.run_cycle(incident_id).await,
                Err(e) => debug!(error = %e, "post-observation transition skipped"),
            }
            return;
        }

        match self
            .store
            .transition(incident_id, IncidentState::Resolved)
            .await
        {
            Ok(incident) => {
                self.audit
                    .emit(AuditRecord::new(
                        AuditPhase::Outcome,
                        incident_id.to_string(),
                        serde_json::json!({
                            "kind": "incident_resolved",
                            "attempts": incident.attempts,
                        }),
                    ))
                    .await;
            }
            Err(e) => debug!(error = %e, "resolve transition skipped"),
        }
    }

    async fn escalate(self: &Arc<Self>, incident_id: Uuid, reason: &str) {
        match self
            .store
            .transition(incident_id, IncidentState::Escalated)
            .await
        {
            Ok(incident) => {
                warn!(incident_id = %incident_id, reason, "incident escalated for human handling");
                self.audit
                    .emit(AuditRecord::new(
                        AuditPhase::Outcome,
                        incident_id.to_string(),
                        serde_json::json!({
                            "kind": "incident_escalated",
                            "reason": reason,
                            "attempts": incident.attempts,
                            "attempted_actions": incident.attempted_actions,
                        }),
                    ))
                    .await;
            }
            Err(e) => debug!(error = %e, "escalate transition skipped"),
        }
    }

    /// Manually resolve a mitigating incident (operator override).  An
    /// in-flight plan observes the terminal state and skips its remaining
    /// actions.
    pub async fn resolve_manual(&self, incident_id: Uuid) -> Result<Incident, CorrelateError> {
        let incident = self
            .store
            .transition(incident_id, IncidentState::Resolved)
            .await?;
        self.audit
            .emit(AuditRecord::new(
                AuditPhase::Outcome,
                incident_id.to_string(),
                serde_json::json!({"kind": "incident_resolved", "manual": true}),
            ))
            .await;
        Ok(incident)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
