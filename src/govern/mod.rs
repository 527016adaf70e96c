//! Guardrails for healing plans.
//!
//! The [`SafetyGovernor`] gatekeeps every plan before dispatch: per-target
//! cooldown, global in-flight concurrency cap, autonomy ceiling, and
//! blast-radius limit.  All state sits behind one `tokio::sync::Mutex`, so
//! check-and-reserve is atomic -- two plans racing for the last execution
//! slot cannot both pass.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::SafetyConfig;
use crate::decide::{HealingPlan, RiskTier};

// ---------------------------------------------------------------------------
// AutonomyMode
// ---------------------------------------------------------------------------

/// Operator-configured ceiling on how much risk may be auto-executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    /// Nothing executes without explicit human approval.
    Manual,
    /// Low and medium risk may auto-execute.
    SemiAuto,
    /// All risk tiers may auto-execute.
    Autonomous,
}

impl AutonomyMode {
    pub fn permits(&self, risk: RiskTier) -> bool {
        match self {
            AutonomyMode::Manual => false,
            AutonomyMode::SemiAuto => risk <= RiskTier::Medium,
            AutonomyMode::Autonomous => true,
        }
    }
}

// ---------------------------------------------------------------------------
// GuardrailViolation
// ---------------------------------------------------------------------------

/// Reason codes for plan rejection.  The correlation engine uses these to
/// decide between retrying with the next candidate and escalating.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GuardrailViolation {
    #[error("target {target} in post-action cooldown for another {remaining_sec}s")]
    CooldownActive { target: String, remaining_sec: i64 },
    #[error("in-flight plan cap reached ({in_flight}/{cap})")]
    ConcurrencyCapReached { in_flight: u32, cap: u32 },
    #[error("risk tier {risk:?} exceeds what autonomy mode {mode:?} permits")]
    AutonomyExceeded { risk: RiskTier, mode: AutonomyMode },
    #[error("action blast radius {fraction:.2} exceeds limit {limit:.2}")]
    BlastRadiusExceeded { fraction: f64, limit: f64 },
}

impl GuardrailViolation {
    /// Stable machine-readable code for audit records.
    pub fn code(&self) -> &'static str {
        match self {
            GuardrailViolation::CooldownActive { .. } => "cooldown_active",
            GuardrailViolation::ConcurrencyCapReached { .. } => "concurrency_cap",
            GuardrailViolation::AutonomyExceeded { .. } => "autonomy_exceeded",
            GuardrailViolation::BlastRadiusExceeded { .. } => "blast_radius",
        }
    }
}

// ---------------------------------------------------------------------------
// SafetyGovernor
// ---------------------------------------------------------------------------

struct GovernorInner {
    /// Plans currently executing across the whole system.
    in_flight: u32,
    /// Per-target cooldown expiry after a completed plan.
    cooldowns: HashMap<String, DateTime<Utc>>,
}

/// Pure gatekeeping over candidate plans plus the small amount of global
/// state the guardrails need.
pub struct SafetyGovernor {
    inner: Mutex<GovernorInner>,
    config: SafetyConfig,
}

impl SafetyGovernor {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            inner: Mutex::new(GovernorInner {
                in_flight: 0,
                cooldowns: HashMap::new(),
            }),
            config,
        }
    }

    /// Check a plan against every guardrail and, if all pass, reserve an
    /// execution slot.  The reservation must be returned through
    /// [`release`](Self::release) (plan ran) or
    /// [`surrender`](Self::surrender) (plan never dispatched).
    pub async fn approve(&self, plan: &HealingPlan) -> Result<(), GuardrailViolation> {
        // Autonomy ceiling first: it is independent of mutable state.
        if !self.config.autonomy_mode.permits(plan.risk) {
            debug!(plan_id = %plan.plan_id, risk = ?plan.risk, "autonomy ceiling rejects plan");
            return Err(GuardrailViolation::AutonomyExceeded {
                risk: plan.risk,
                mode: self.config.autonomy_mode,
            });
        }

        // Blast radius, per action.
        for action in &plan.actions {
            if action.blast_fraction > self.config.blast_radius_limit {
                debug!(
                    plan_id = %plan.plan_id,
                    fraction = action.blast_fraction,
                    limit = self.config.blast_radius_limit,
                    "blast radius rejects plan"
                );
                return Err(GuardrailViolation::BlastRadiusExceeded {
                    fraction: action.blast_fraction,
                    limit: self.config.blast_radius_limit,
                });
            }
        }

        let mut inner = self.inner.lock().await;

        // Post-action cooldown for the target.
        if let Some(&until) = inner.cooldowns.get(plan.target()) {
            let now = Utc::now();
            if now < until {
                let remaining_sec = (until - now).num_seconds().max(1);
                debug!(
                    plan_id = %plan.plan_id,
                    target = plan.target(),
                    remaining_sec,
                    "cooldown rejects plan"
                );
                return Err(GuardrailViolation::CooldownActive {
                    target: plan.target().to_string(),
                    remaining_sec,
                });
            }
        }

        // Global concurrency cap; reservation happens under the same lock.
        if inner.in_flight >= self.config.max_concurrent_plans {
            debug!(
                plan_id = %plan.plan_id,
                in_flight = inner.in_flight,
                cap = self.config.max_concurrent_plans,
                "concurrency cap rejects plan"
            );
            return Err(GuardrailViolation::ConcurrencyCapReached {
                in_flight: inner.in_flight,
                cap: self.config.max_concurrent_plans,
            });
        }

        inner.in_flight += 1;
        info!(
            plan_id = %plan.plan_id,
            target = plan.target(),
            in_flight = inner.in_flight,
            "plan approved"
        );
        Ok(())
    }

    /// Release a reserved slot after the plan concluded, starting the
    /// target's post-action cooldown.
    pub async fn release(&self, target: &str) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if self.config.cooldown_sec > 0 {
            inner.cooldowns.insert(
                target.to_string(),
                Utc::now() + Duration::seconds(self.config.cooldown_sec as i64),
            );
        }
        debug!(target, in_flight = inner.in_flight, "execution slot released");
    }

    /// Return a reserved slot for a plan that was never dispatched (e.g. it
    /// lost the attach race).  No cooldown starts.
    pub async fn surrender(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Plans currently holding execution slots.
    pub async fn in_flight(&self) -> u32 {
        self.inner.lock().await.in_flight
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
