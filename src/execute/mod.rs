//! Execution coordination: dispatch an approved plan to the external
//! action executor, action by action, with mandatory timeouts.
//!
//! Fail-fast: a failed or timed-out action aborts the rest of the plan,
//! since later actions may assume the earlier ones succeeded.  The
//! coordinator never retries; a retry is a fresh remediation attempt
//! decided on the next cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEmitter, AuditPhase, AuditRecord};
use crate::correlate::IncidentStore;
use crate::decide::{ActionType, HealingPlan};

// ---------------------------------------------------------------------------
// Dispatch contract
// ---------------------------------------------------------------------------

/// One action dispatch as seen by the external executor.
#[derive(Debug, Clone, Serialize)]
pub struct ActionDispatch {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub target: String,
    pub parameters: serde_json::Value,
    /// Caller-assigned token correlating executor responses to the plan.
    pub correlation_token: Uuid,
    /// Budget the executor must complete within (seconds).
    pub timeout_budget_sec: u64,
}

/// Executor response for a single action.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("action {action_id} timed out after {timeout_sec}s")]
    Timeout { action_id: Uuid, timeout_sec: u64 },
    #[error("action {action_id} failed: {reason}")]
    Failed { action_id: Uuid, reason: String },
    #[error("executor transport error: {0}")]
    Transport(String),
}

/// Seam to whatever actually performs remediation (smoke-tested against a
/// kubernetes executor service; mocked in tests).
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, dispatch: &ActionDispatch) -> Result<ActionResult, ExecError>;
}

// ---------------------------------------------------------------------------
// HttpActionExecutor
// ---------------------------------------------------------------------------

/// Dispatches actions to the external executor over HTTP.
pub struct HttpActionExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpActionExecutor {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/api/v1/execute", base_url.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn execute(&self, dispatch: &ActionDispatch) -> Result<ActionResult, ExecError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(dispatch)
            .send()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ExecError::Failed {
                action_id: dispatch.action_id,
                reason: format!("executor returned status {}", response.status()),
            });
        }

        response
            .json::<ActionResult>()
            .await
            .map_err(|e| ExecError::Transport(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Plan outcome
// ---------------------------------------------------------------------------

/// Terminal result of running one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    Succeeded,
    Failed,
    TimedOut,
    /// The incident reached a terminal state while the plan was in flight;
    /// remaining actions were skipped.
    Cancelled,
}

/// Per-action note kept for the outcome report.
#[derive(Debug, Clone, Serialize)]
pub struct ActionNote {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub disposition: String,
}

/// Report fed back to the correlation engine when a plan concludes.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub plan_id: Uuid,
    pub incident_id: Uuid,
    pub outcome: PlanOutcome,
    pub actions: Vec<ActionNote>,
}

// ---------------------------------------------------------------------------
// ExecutionCoordinator
// ---------------------------------------------------------------------------

/// Runs approved plans against the executor, one plan at a time per
/// incident, off the correlation path.
pub struct ExecutionCoordinator {
    executor: Arc<dyn ActionExecutor>,
    store: Arc<IncidentStore>,
    audit: Arc<AuditEmitter>,
    action_timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        store: Arc<IncidentStore>,
        audit: Arc<AuditEmitter>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            audit,
            action_timeout,
        }
    }

    /// Execute a plan's actions in declared order.
    ///
    /// Before each dispatch the incident state is re-checked: if the
    /// incident was resolved or escalated out from under us, remaining
    /// actions are skipped and the plan reports `Cancelled`.
    pub async fn run_plan(&self, plan: &HealingPlan) -> PlanReport {
        let mut notes = Vec::with_capacity(plan.actions.len());
        let mut outcome = PlanOutcome::Succeeded;

        for action in &plan.actions {
            if let Some(state) = self.store.state(plan.incident_id).await {
                if state.is_terminal() {
                    info!(
                        plan_id = %plan.plan_id,
                        incident_id = %plan.incident_id,
                        state = %state,
                        "incident closed mid-plan; skipping remaining actions"
                    );
                    notes.push(ActionNote {
                        action_id: action.action_id,
                        action_type: action.action_type,
                        disposition: "skipped".to_string(),
                    });
                    outcome = PlanOutcome::Cancelled;
                    break;
                }
            }

            let dispatch = ActionDispatch {
                action_id: action.action_id,
                action_type: action.action_type,
                target: action.target.clone(),
                parameters: action.parameters.clone(),
                correlation_token: plan.plan_id,
                timeout_budget_sec: self.action_timeout.as_secs(),
            };

            self.audit
                .emit(AuditRecord::new(
                    AuditPhase::Act,
                    action.action_id.to_string(),
                    serde_json::json!({
                        "kind": "action_dispatched",
                        "plan_id": plan.plan_id,
                        "action_type": action.action_type.label(),
                        "target": action.target,
                    }),
                ))
                .await;

            let (disposition, next) =
                match tokio::time::timeout(self.action_timeout, self.executor.execute(&dispatch))
                    .await
                {
                    Err(_) => {
                        warn!(
                            action_id = %action.action_id,
                            timeout_sec = self.action_timeout.as_secs(),
                            "action dispatch timed out"
                        );
                        ("timed_out".to_string(), Some(PlanOutcome::TimedOut))
                    }
                    Ok(Err(e)) => {
                        warn!(action_id = %action.action_id, error = %e, "action failed");
                        (format!("failed: {e}"), Some(PlanOutcome::Failed))
                    }
                    Ok(Ok(result)) if !result.success => {
                        warn!(action_id = %action.action_id, "executor reported failure");
                        ("failed: executor reported failure".to_string(), Some(PlanOutcome::Failed))
                    }
                    Ok(Ok(_)) => ("succeeded".to_string(), None),
                };

            notes.push(ActionNote {
                action_id: action.action_id,
                action_type: action.action_type,
                disposition,
            });

            if let Some(failed) = next {
                outcome = failed;
                break;
            }
        }

        info!(
            plan_id = %plan.plan_id,
            incident_id = %plan.incident_id,
            outcome = ?outcome,
            actions = notes.len(),
            "plan concluded"
        );

        PlanReport {
            plan_id: plan.plan_id,
            incident_id: plan.incident_id,
            outcome,
            actions: notes,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
