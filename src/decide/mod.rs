//! Decision engine: map an incident and its ranked hypotheses to a
//! risk-scored healing plan, or abstain.
//!
//! Each root-cause category carries a small ordered candidate-action
//! catalog; the engine picks the first candidate not already attempted for
//! the incident.  Below the configured confidence floor the engine returns
//! a no-viable-plan error rather than guessing -- precision over recall, a
//! wrong disruptive action is worse than none.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::DecisionConfig;
use crate::correlate::Incident;
use crate::ingest::Severity;
use crate::orient::Hypothesis;

// ---------------------------------------------------------------------------
// Action and plan types
// ---------------------------------------------------------------------------

/// Remediation step kinds the external executor understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Restart,
    ScaleOut,
    Rollback,
    AdjustResources,
}

impl ActionType {
    /// Intrinsic risk of the action kind, before severity adjustment.
    fn base_risk(&self) -> RiskTier {
        match self {
            ActionType::Restart => RiskTier::Low,
            ActionType::ScaleOut => RiskTier::Low,
            ActionType::AdjustResources => RiskTier::Medium,
            ActionType::Rollback => RiskTier::High,
        }
    }

    /// Fraction of a service's replicas the action touches at once.
    fn blast_fraction(&self) -> f64 {
        match self {
            ActionType::Restart => 0.25,
            ActionType::ScaleOut => 0.2,
            ActionType::AdjustResources => 0.5,
            ActionType::Rollback => 1.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionType::Restart => "restart",
            ActionType::ScaleOut => "scale_out",
            ActionType::Rollback => "rollback",
            ActionType::AdjustResources => "adjust_resources",
        }
    }
}

/// Risk tiers ordered from safest to most disruptive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    fn bumped(self) -> RiskTier {
        match self {
            RiskTier::Low => RiskTier::Medium,
            RiskTier::Medium | RiskTier::High => RiskTier::High,
        }
    }
}

/// Whether the plan may run unattended or needs a human sign-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyRequirement {
    AutoExecute,
    RequiresApproval,
}

/// A single remediation step, executed atomically by the external executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub action_id: Uuid,
    pub action_type: ActionType,
    /// `namespace/service` reference of the workload being touched.
    pub target: String,
    pub parameters: serde_json::Value,
    pub expected_outcome: String,
    /// Fraction of the target's replicas this step may affect; checked
    /// against the blast-radius guardrail.
    pub blast_fraction: f64,
}

/// An ordered, risk-scored sequence of remediation actions for one
/// incident.  At most one plan is active per incident at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingPlan {
    pub plan_id: Uuid,
    pub incident_id: Uuid,
    pub actions: Vec<Action>,
    /// Overall confidence in [0, 1].
    pub confidence: f64,
    pub risk: RiskTier,
    pub autonomy: AutonomyRequirement,
    pub created_at: DateTime<Utc>,
}

impl HealingPlan {
    /// `namespace/service` target shared by the plan's actions.
    pub fn target(&self) -> &str {
        self.actions
            .first()
            .map(|a| a.target.as_str())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Candidate catalogs
// ---------------------------------------------------------------------------

/// Ordered candidate actions per root-cause category, safest viable option
/// first.
fn catalog(category: &str) -> &'static [ActionType] {
    match category {
        "error_rate_spike" => &[ActionType::ScaleOut, ActionType::Restart, ActionType::Rollback],
        "latency_spike" => &[
            ActionType::ScaleOut,
            ActionType::AdjustResources,
            ActionType::Restart,
        ],
        "cpu_overload" => &[ActionType::ScaleOut, ActionType::AdjustResources],
        "memory_overload" => &[ActionType::Restart, ActionType::AdjustResources],
        "pod_crash_loop" => &[ActionType::Rollback, ActionType::Restart],
        "deployment_failure" => &[ActionType::Rollback],
        "health_check_failure" => &[ActionType::Restart, ActionType::Rollback],
        _ => &[],
    }
}

/// How reliably the catalog's actions fix the given category, from past
/// operational experience.  Scales the top hypothesis confidence into the
/// plan confidence.
fn reliability(category: &str) -> f64 {
    match category {
        "error_rate_spike" => 0.9,
        "latency_spike" => 0.8,
        "cpu_overload" => 0.85,
        "memory_overload" => 0.85,
        "pod_crash_loop" => 0.75,
        "deployment_failure" => 0.7,
        "health_check_failure" => 0.8,
        _ => 0.5,
    }
}

fn parameters_for(action_type: ActionType) -> serde_json::Value {
    match action_type {
        ActionType::Restart => serde_json::json!({
            "strategy": "rolling",
            "max_unavailable": 1,
        }),
        ActionType::ScaleOut => serde_json::json!({
            "increment": 1,
            "max_replicas": 10,
        }),
        ActionType::Rollback => serde_json::json!({
            "revision": -1,
        }),
        ActionType::AdjustResources => serde_json::json!({
            "cpu_multiplier": 1.5,
            "memory_multiplier": 1.5,
        }),
    }
}

fn expected_outcome_for(action_type: ActionType, category: &str) -> String {
    match action_type {
        ActionType::Restart => format!("fresh pods clear the {category} condition"),
        ActionType::ScaleOut => format!("added replicas absorb the load behind {category}"),
        ActionType::Rollback => format!("previous revision no longer exhibits {category}"),
        ActionType::AdjustResources => {
            format!("raised resource limits relieve the {category} pressure")
        }
    }
}

// ---------------------------------------------------------------------------
// DecisionEngine
// ---------------------------------------------------------------------------

/// Reasons the engine abstains from proposing a plan.
#[derive(Debug, Error, PartialEq)]
pub enum DecisionError {
    #[error("no hypotheses for incident {0}")]
    NoHypotheses(Uuid),
    #[error("top hypothesis confidence {confidence:.2} below floor {floor:.2}")]
    BelowConfidenceFloor { confidence: f64, floor: f64 },
    #[error("all candidate actions for {category} already attempted")]
    CandidatesExhausted { category: String },
}

/// Maps incidents and hypotheses to healing plans.
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    /// Produce a plan for the incident, or a reason why no safe plan
    /// exists.  Pure with respect to the incident snapshot.
    pub fn decide(
        &self,
        incident: &Incident,
        hypotheses: &[Hypothesis],
    ) -> Result<HealingPlan, DecisionError> {
        let top = hypotheses
            .first()
            .ok_or(DecisionError::NoHypotheses(incident.incident_id))?;

        if top.confidence < self.config.confidence_floor {
            return Err(DecisionError::BelowConfidenceFloor {
                confidence: top.confidence,
                floor: self.config.confidence_floor,
            });
        }

        let action_type = catalog(&top.category)
            .iter()
            .copied()
            .find(|candidate| !incident.attempted_actions.contains(candidate))
            .ok_or_else(|| DecisionError::CandidatesExhausted {
                category: top.category.clone(),
            })?;

        let target = format!("{}/{}", incident.key.namespace, incident.key.service);
        let action = Action {
            action_id: Uuid::new_v4(),
            action_type,
            target,
            parameters: parameters_for(action_type),
            expected_outcome: expected_outcome_for(action_type, &top.category),
            blast_fraction: action_type.blast_fraction(),
        };

        let risk = if incident.severity == Severity::Critical {
            action_type.base_risk().bumped()
        } else {
            action_type.base_risk()
        };
        let autonomy = if risk == RiskTier::High {
            AutonomyRequirement::RequiresApproval
        } else {
            AutonomyRequirement::AutoExecute
        };
        let confidence = (top.confidence * reliability(&top.category)).clamp(0.0, 1.0);

        let plan = HealingPlan {
            plan_id: Uuid::new_v4(),
            incident_id: incident.incident_id,
            actions: vec![action],
            confidence,
            risk,
            autonomy,
            created_at: Utc::now(),
        };

        debug!(
            incident_id = %incident.incident_id,
            plan_id = %plan.plan_id,
            action = action_type.label(),
            confidence = plan.confidence,
            risk = ?plan.risk,
            "plan proposed"
        );
        Ok(plan)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
