//! HTTP request handlers.

use super::AppState;
use crate::activity::ActivityEntry;
use crate::db::{MonitorTarget, ProbeOutcome, Proof};
use crate::error::MonitorError;
use crate::scheduler::SweepSummary;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Redirect, Response},
};
use serde::Deserialize;
use serde_json::json;

const DEFAULT_TOP: usize = 10;
const MAX_TOP: usize = 100;

fn not_found(what: &str, id: i64) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("{} {} not found", what, id) })),
    )
        .into_response()
}

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(
    State(state): State<AppState>,
) -> Result<Json<Vec<MonitorTarget>>, MonitorError> {
    Ok(Json(state.registry.get_all()?))
}

pub async fn handle_get_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, MonitorError> {
    Ok(match state.registry.get_by_id(id)? {
        Some(target) => Json(target).into_response(),
        None => not_found("target", id),
    })
}

#[derive(Debug, Deserialize)]
pub struct ProofRequest {
    #[serde(default = "default_proof_type")]
    pub proof_type: String,
    pub content: String,
}

fn default_proof_type() -> String {
    "note".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub proof: Option<ProofRequest>,
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<CreateTargetRequest>,
) -> Result<(StatusCode, Json<MonitorTarget>), MonitorError> {
    let proof = req.proof.map(|p| Proof::new(&p.proof_type, &p.content));
    let target = state
        .registry
        .add(&req.name, &req.description, &req.url, proof)?;
    Ok((StatusCode::CREATED, Json(target)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTargetRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub url: String,
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateTargetRequest>,
) -> Result<Response, MonitorError> {
    Ok(
        match state
            .registry
            .update(id, &req.name, &req.description, &req.url)?
        {
            Some(target) => Json(target).into_response(),
            None => not_found("target", id),
        },
    )
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, MonitorError> {
    if state.registry.remove(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

// ============================================================================
// API: Checks
// ============================================================================

pub async fn handle_check_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, MonitorError> {
    let cancel = state.shutdown.child_token();
    let outcome: Option<ProbeOutcome> = state.orchestrator.check_one(id, &cancel).await?;
    Ok(match outcome {
        Some(outcome) => Json(outcome).into_response(),
        None => not_found("target", id),
    })
}

pub async fn handle_sweep(
    State(state): State<AppState>,
) -> Result<Json<SweepSummary>, MonitorError> {
    let cancel = state.shutdown.child_token();
    Ok(Json(state.orchestrator.check_all(&cancel).await?))
}

// ============================================================================
// API: Popularity, proofs, diagnostics
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default)]
    pub take: Option<usize>,
}

pub async fn handle_top(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<Vec<MonitorTarget>>, MonitorError> {
    let take = query.take.unwrap_or(DEFAULT_TOP).min(MAX_TOP);
    Ok(Json(state.registry.get_top_by_clicks(take)?))
}

pub async fn handle_get_proof(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, MonitorError> {
    Ok(match state.registry.get_proof_by_id(id)? {
        Some(proof) => Json(proof).into_response(),
        None => not_found("proof", id),
    })
}

pub async fn handle_activity(State(state): State<AppState>) -> Json<Vec<ActivityEntry>> {
    Json(state.activity.entries())
}

/// Count the click, then send the visitor on to the target.
pub async fn handle_go(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, MonitorError> {
    Ok(match state.registry.register_click(id)? {
        Some(url) => Redirect::to(&url).into_response(),
        None => not_found("target", id),
    })
}
