//! End-to-end pipeline scenarios: ingestion through correlation,
//! decision, governance, execution, and lifecycle resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use autoheal::audit::{AuditEmitter, MemoryAuditSink};
use autoheal::config::{CorrelationConfig, DecisionConfig, SafetyConfig};
use autoheal::correlate::{CorrelationEngine, IncidentState, IncidentStore};
use autoheal::decide::{ActionType, DecisionEngine};
use autoheal::execute::{
    ActionDispatch, ActionExecutor, ActionResult, ExecError, ExecutionCoordinator,
};
use autoheal::govern::{AutonomyMode, SafetyGovernor};
use autoheal::ingest::{
    AnomalyEvent, AnomalyType, IngestGateway, Severity, ThresholdDirection,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Executor double whose behavior is fixed per test.
struct FakeExecutor {
    succeed: bool,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeExecutor {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            succeed: false,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            succeed: true,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for FakeExecutor {
    async fn execute(&self, dispatch: &ActionDispatch) -> Result<ActionResult, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.succeed {
            Ok(ActionResult {
                success: true,
                detail: serde_json::json!({"handled": dispatch.action_id}),
            })
        } else {
            Err(ExecError::Failed {
                action_id: dispatch.action_id,
                reason: "simulated executor failure".to_string(),
            })
        }
    }
}

struct Harness {
    gateway: Arc<IngestGateway>,
    engine: Arc<CorrelationEngine>,
    store: Arc<IncidentStore>,
    governor: Arc<SafetyGovernor>,
    audit: Arc<MemoryAuditSink>,
}

fn harness(
    executor: Arc<dyn ActionExecutor>,
    correlation: CorrelationConfig,
    decision: DecisionConfig,
    safety: SafetyConfig,
) -> Harness {
    let audit_sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(AuditEmitter::new(audit_sink.clone()));
    let store = Arc::new(IncidentStore::new());
    let governor = Arc::new(SafetyGovernor::new(safety));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        executor,
        store.clone(),
        audit.clone(),
        Duration::from_secs(5),
    ));
    let engine = Arc::new(CorrelationEngine::new(
        store.clone(),
        DecisionEngine::new(decision),
        governor.clone(),
        coordinator,
        audit.clone(),
        correlation,
    ));
    let gateway = Arc::new(IngestGateway::new(engine.clone(), audit));
    Harness {
        gateway,
        engine,
        store,
        governor,
        audit: audit_sink,
    }
}

fn autonomous_safety() -> SafetyConfig {
    SafetyConfig {
        cooldown_sec: 0,
        max_concurrent_plans: 8,
        blast_radius_limit: 1.0,
        autonomy_mode: AutonomyMode::Autonomous,
    }
}

fn quick_correlation() -> CorrelationConfig {
    CorrelationConfig {
        correlation_window_sec: 300,
        observation_window_sec: 0,
        max_attempts: 3,
    }
}

fn default_decision() -> DecisionConfig {
    DecisionConfig {
        confidence_floor: 0.4,
    }
}

fn error_spike(id: &str, service: &str, at: DateTime<Utc>, severity: Severity) -> AnomalyEvent {
    AnomalyEvent {
        event_id: id.to_string(),
        timestamp: at,
        source: "monitoring".to_string(),
        anomaly_type: AnomalyType::ErrorRateSpike,
        severity,
        target_service: service.to_string(),
        target_namespace: "default".to_string(),
        metric_name: "error_rate".to_string(),
        current_value: 12.0,
        threshold_value: 5.0,
        threshold_direction: ThresholdDirection::Above,
        window_seconds: 60,
        context: HashMap::new(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_merge_heal_resolve() {
    let executor = FakeExecutor::succeeding();
    let h = harness(
        executor.clone(),
        quick_correlation(),
        default_decision(),
        autonomous_safety(),
    );

    let now = Utc::now();
    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();
    assert!(!first.duplicate);
    let incident_id = first.incident_id.unwrap();

    // Second spike 30s later merges into the same incident.
    let second = h
        .gateway
        .submit(error_spike(
            "evt-2",
            "payment-service",
            now + chrono::Duration::seconds(30),
            Severity::High,
        ))
        .await
        .unwrap();
    assert_eq!(second.incident_id, Some(incident_id));

    settle().await;

    let incident = h.store.get(incident_id).await.unwrap();
    assert_eq!(incident.state, IncidentState::Resolved);
    assert_eq!(incident.events.len(), 2);
    // First candidate for an error-rate spike is scale-out.
    assert_eq!(incident.attempted_actions.first(), Some(&ActionType::ScaleOut));
    assert!(executor.calls() >= 1);
    // Slot returned after the plan concluded.
    assert_eq!(h.governor.in_flight().await, 0);
}

#[tokio::test]
async fn duplicate_event_id_is_idempotent() {
    let h = harness(
        FakeExecutor::succeeding(),
        CorrelationConfig {
            observation_window_sec: 3600,
            ..quick_correlation()
        },
        DecisionConfig {
            confidence_floor: 0.99, // abstain so the incident stays open
        },
        autonomous_safety(),
    );

    let now = Utc::now();
    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();
    let again = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();

    assert!(again.duplicate);
    assert_eq!(again.incident_id, first.incident_id);

    let incident = h.store.get(first.incident_id.unwrap()).await.unwrap();
    assert_eq!(incident.events.len(), 1, "duplicate contributed nothing");
}

#[tokio::test]
async fn events_for_different_services_open_separate_incidents() {
    let h = harness(
        FakeExecutor::succeeding(),
        CorrelationConfig {
            observation_window_sec: 3600,
            ..quick_correlation()
        },
        DecisionConfig {
            confidence_floor: 0.99,
        },
        autonomous_safety(),
    );

    let now = Utc::now();
    let a = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();
    let b = h
        .gateway
        .submit(error_spike("evt-2", "checkout-service", now, Severity::High))
        .await
        .unwrap();
    assert_ne!(a.incident_id, b.incident_id);
}

#[tokio::test]
async fn cooldown_rejection_keeps_incident_open_and_advances_candidate() {
    let executor = FakeExecutor::succeeding();
    let h = harness(
        executor.clone(),
        quick_correlation(),
        default_decision(),
        SafetyConfig {
            cooldown_sec: 3600,
            ..autonomous_safety()
        },
    );

    // First incident heals and resolves, starting the target's cooldown.
    let now = Utc::now();
    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();
    settle().await;
    let resolved = h.store.get(first.incident_id.unwrap()).await.unwrap();
    assert_eq!(resolved.state, IncidentState::Resolved);

    // A fresh spike opens a new incident; its plan is rejected by the
    // cooldown guardrail and the incident stays open.
    let second = h
        .gateway
        .submit(error_spike(
            "evt-2",
            "payment-service",
            now + chrono::Duration::seconds(10),
            Severity::High,
        ))
        .await
        .unwrap();
    settle().await;

    let incident_id = second.incident_id.unwrap();
    let incident = h.store.get(incident_id).await.unwrap();
    assert_eq!(incident.state, IncidentState::Open);
    assert_eq!(incident.attempts, 1);
    assert_eq!(incident.attempted_actions, vec![ActionType::ScaleOut]);

    // Next qualifying event retries with the next candidate (restart).
    h.gateway
        .submit(error_spike(
            "evt-3",
            "payment-service",
            now + chrono::Duration::seconds(20),
            Severity::High,
        ))
        .await
        .unwrap();
    settle().await;

    let incident = h.store.get(incident_id).await.unwrap();
    assert_eq!(incident.state, IncidentState::Open);
    assert_eq!(incident.attempts, 2);
    assert_eq!(
        incident.attempted_actions,
        vec![ActionType::ScaleOut, ActionType::Restart]
    );
}

#[tokio::test]
async fn execution_failures_exhaust_budget_and_escalate() {
    let executor = FakeExecutor::failing();
    let h = harness(
        executor.clone(),
        CorrelationConfig {
            max_attempts: 2,
            ..quick_correlation()
        },
        default_decision(),
        autonomous_safety(),
    );

    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", Utc::now(), Severity::High))
        .await
        .unwrap();
    settle().await;

    let incident = h.store.get(first.incident_id.unwrap()).await.unwrap();
    assert_eq!(incident.state, IncidentState::Escalated);
    assert_eq!(incident.attempts, 2);
    assert!(incident.active_plan.is_none());
    assert_eq!(executor.calls(), 2);

    // The audit trail documents every attempt and the escalation.
    let records = h.audit.records().await;
    let proposed = records
        .iter()
        .filter(|r| r.payload["kind"] == "plan_proposed")
        .count();
    assert_eq!(proposed, 2);
    assert!(records
        .iter()
        .any(|r| r.payload["kind"] == "incident_escalated"));
}

#[tokio::test]
async fn low_confidence_never_yields_a_plan() {
    let executor = FakeExecutor::succeeding();
    let h = harness(
        executor.clone(),
        quick_correlation(),
        DecisionConfig {
            confidence_floor: 0.99,
        },
        autonomous_safety(),
    );

    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", Utc::now(), Severity::Critical))
        .await
        .unwrap();
    settle().await;

    let incident = h.store.get(first.incident_id.unwrap()).await.unwrap();
    assert_eq!(incident.state, IncidentState::Open);
    assert_eq!(incident.attempts, 0);
    assert_eq!(executor.calls(), 0, "no action may be guessed below the floor");

    let records = h.audit.records().await;
    assert!(records
        .iter()
        .any(|r| r.payload["kind"] == "no_viable_plan"));
}

#[tokio::test]
async fn concurrent_bursts_attach_at_most_one_plan() {
    // Slow executor keeps the plan in flight while the burst lands.
    let h = harness(
        FakeExecutor::slow(Duration::from_millis(400)),
        CorrelationConfig {
            observation_window_sec: 3600,
            ..quick_correlation()
        },
        default_decision(),
        autonomous_safety(),
    );

    let now = Utc::now();
    let mut handles = Vec::new();
    for i in 0..12 {
        let gateway = h.gateway.clone();
        let event = error_spike(&format!("evt-{i}"), "payment-service", now, Severity::High);
        handles.push(tokio::spawn(async move { gateway.submit(event).await }));
    }

    let mut incident_id = None;
    for handle in handles {
        let acceptance = handle.await.unwrap().unwrap();
        let id = acceptance.incident_id.unwrap();
        if let Some(existing) = incident_id {
            assert_eq!(existing, id, "burst must collapse into one incident");
        }
        incident_id = Some(id);
    }

    let incident = h.store.get(incident_id.unwrap()).await.unwrap();
    assert_eq!(incident.state, IncidentState::Mitigating);
    assert_eq!(incident.attempts, 1, "exactly one plan attached");
    assert_eq!(incident.events.len(), 12);
    assert!(h.governor.in_flight().await <= 1);
}

#[tokio::test]
async fn manual_resolution_cancels_inflight_remediation() {
    let executor = FakeExecutor::slow(Duration::from_millis(500));
    let h = harness(
        executor.clone(),
        CorrelationConfig {
            observation_window_sec: 3600,
            ..quick_correlation()
        },
        default_decision(),
        autonomous_safety(),
    );

    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", Utc::now(), Severity::High))
        .await
        .unwrap();
    let incident_id = first.incident_id.unwrap();

    // Give the cycle time to attach and start executing, then resolve by
    // hand while the action is still in flight.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resolved = h.engine.resolve_manual(incident_id).await.unwrap();
    assert_eq!(resolved.state, IncidentState::Resolved);

    tokio::time::sleep(Duration::from_millis(600)).await;

    // The late outcome of the in-flight plan triggers no further remediation.
    let incident = h.store.get(incident_id).await.unwrap();
    assert_eq!(incident.state, IncidentState::Resolved);
    assert_eq!(incident.attempts, 1);
    assert_eq!(h.governor.in_flight().await, 0);
}

#[tokio::test]
async fn new_event_during_observation_reopens_instead_of_resolving() {
    let h = harness(
        FakeExecutor::succeeding(),
        CorrelationConfig {
            observation_window_sec: 1,
            max_attempts: 10,
            ..quick_correlation()
        },
        default_decision(),
        autonomous_safety(),
    );

    let now = Utc::now();
    let first = h
        .gateway
        .submit(error_spike("evt-1", "payment-service", now, Severity::High))
        .await
        .unwrap();
    let incident_id = first.incident_id.unwrap();

    // While the observation window is open, the anomaly recurs.
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.gateway
        .submit(error_spike(
            "evt-2",
            "payment-service",
            Utc::now(),
            Severity::High,
        ))
        .await
        .unwrap();

    // After the window, the incident must not be resolved: the recurrence
    // proves the first remediation did not stick.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let incident = h.store.get(incident_id).await.unwrap();
    assert_ne!(incident.state, IncidentState::Resolved);
    assert!(incident.attempts >= 2, "a fresh cycle ran after the recurrence");
}
