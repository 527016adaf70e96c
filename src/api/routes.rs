//! API route definitions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::correlate::CorrelateError;
use crate::ingest::AnomalyEvent;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/resolve", post(resolve_incident))
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let incidents = state.store.list().await;
    let active = incidents.iter().filter(|i| !i.state.is_terminal()).count();
    let resolved = incidents
        .iter()
        .filter(|i| i.state == crate::correlate::IncidentState::Resolved)
        .count();
    let closed = incidents.len() - active;
    let success_rate = if closed > 0 {
        resolved as f64 / closed as f64
    } else {
        0.0
    };
    envelope(
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "incidents_total": incidents.len(),
            "incidents_active": active,
            "incidents_resolved": resolved,
            "success_rate": success_rate,
        }),
        json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
    )
}

/// Anomaly ingestion contract: acceptance with the incident identifier,
/// or a validation error with no state created.
async fn submit_event(
    State(state): State<AppState>,
    Json(event): Json<AnomalyEvent>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    match state.gateway.submit(event).await {
        Ok(acceptance) => Ok((
            StatusCode::ACCEPTED,
            envelope(
                json!(acceptance),
                json!({ "timestamp": chrono::Utc::now().to_rfc3339() }),
            ),
        )),
        Err(e) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": { "kind": "validation", "message": e.to_string() } })),
        )),
    }
}

async fn list_incidents(State(state): State<AppState>) -> Json<Value> {
    let incidents = state.store.list().await;
    let total = incidents.len();
    envelope(json!(incidents), json!({ "total": total }))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.get(id).await {
        Some(incident) => Ok(envelope(json!(incident), json!({}))),
        None => Err(not_found(id)),
    }
}

/// Operator override: resolve a mitigating incident by hand.  Any
/// in-flight plan observes the terminal state and stops dispatching.
async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.engine.resolve_manual(id).await {
        Ok(incident) => Ok(envelope(json!(incident), json!({ "manual": true }))),
        Err(CorrelateError::NotFound(_)) => Err(not_found(id)),
        Err(e) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": { "kind": "conflict", "message": e.to_string() } })),
        )),
    }
}

fn not_found(id: Uuid) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "kind": "not_found", "message": format!("incident {id} not found") } })),
    )
}
