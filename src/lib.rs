//! AutoHeal -- anomaly correlation and bounded-risk autonomous remediation.
//!
//! This crate turns raw infrastructure anomaly signals into deduplicated
//! incidents and guard-railed healing plans: events are correlated into
//! incidents, each incident update drives one observe-orient-decide-act
//! cycle, and approved plans are dispatched to an external executor with
//! an immutable audit trail at every step.

pub mod api;
pub mod audit;
pub mod config;
pub mod correlate;
pub mod decide;
pub mod execute;
pub mod govern;
pub mod ingest;
pub mod orient;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::state::AppState;
use crate::audit::{AuditEmitter, JsonlAuditSink};
use crate::config::AutohealConfig;
use crate::correlate::{CorrelationEngine, IncidentStore};
use crate::decide::DecisionEngine;
use crate::execute::{ExecutionCoordinator, HttpActionExecutor};
use crate::govern::SafetyGovernor;
use crate::ingest::IngestGateway;

/// Start the AutoHeal daemon: ingestion API plus the remediation pipeline.
pub async fn serve(bind: &str, config: AutohealConfig) -> Result<()> {
    // 1. Audit trail first so every later step can be recorded.
    let sink = JsonlAuditSink::open(config.logging.audit_log_path.clone()).await?;
    let audit = Arc::new(AuditEmitter::new(Arc::new(sink)));

    // 2. Pipeline components, each against its own config section.
    let store = Arc::new(IncidentStore::new());
    let governor = Arc::new(SafetyGovernor::new(config.safety.clone()));
    let executor = Arc::new(HttpActionExecutor::new(&config.execution.executor_url));
    let coordinator = Arc::new(ExecutionCoordinator::new(
        executor,
        store.clone(),
        audit.clone(),
        Duration::from_secs(config.execution.action_timeout_sec),
    ));
    let engine = Arc::new(CorrelationEngine::new(
        store.clone(),
        DecisionEngine::new(config.decision.clone()),
        governor,
        coordinator,
        audit.clone(),
        config.correlation.clone(),
    ));
    let gateway = Arc::new(IngestGateway::new(engine.clone(), audit));

    // 3. API server.
    let state = AppState {
        gateway,
        engine,
        store,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!(%addr, "autoheal listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
