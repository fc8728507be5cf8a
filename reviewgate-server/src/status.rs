//! Operator endpoints: `/status` (every tracked PR) and
//! `/gate/{owner}/{repo}/{number}` (one PR's merge gate).

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reviewgate_core::{GateDecision, Login, PrKey, PrLifecycle, RunStatus};
use serde::Serialize;
use tracing::error;

use crate::error::GateError;
use crate::state_machine::TrackedPullRequest;
use crate::AppState;

/// Counts by lifecycle phase.
#[derive(Debug, Default, Serialize)]
pub struct StatusSummary {
    pub total_prs: usize,
    pub open: usize,
    pub awaiting_approvals: usize,
    pub awaiting_checks: usize,
    pub ready: usize,
}

#[derive(Debug, Serialize)]
pub struct WorkflowStatusEntry {
    pub workflow: String,
    pub status: RunStatus,
    pub attempts: u32,
}

#[derive(Debug, Serialize)]
pub struct PrStatusEntry {
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: u64,
    pub revision: String,
    pub lifecycle: PrLifecycle,
    pub merge_ready: bool,
    pub approvals: u32,
    pub required_approvals: u32,
    pub reviewers: Vec<Login>,
    pub invalid_reviewers: Vec<Login>,
    pub workflows: Vec<WorkflowStatusEntry>,
    /// Human-readable unsatisfied requirements.
    pub unsatisfied: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
    pub prs: Vec<PrStatusEntry>,
}

impl StatusData {
    pub fn from_states(states: Vec<TrackedPullRequest>, version: String) -> Self {
        let mut summary = StatusSummary {
            total_prs: states.len(),
            ..Default::default()
        };

        let prs = states
            .into_iter()
            .map(|pr| {
                match pr.lifecycle {
                    PrLifecycle::Open => summary.open += 1,
                    PrLifecycle::AwaitingApprovals => summary.awaiting_approvals += 1,
                    PrLifecycle::AwaitingChecks => summary.awaiting_checks += 1,
                    PrLifecycle::Ready => summary.ready += 1,
                    // Evicted on close; never stored.
                    PrLifecycle::Merged | PrLifecycle::Closed => {}
                }
                let gate = pr.gate();
                PrStatusEntry {
                    repo_owner: pr.key.repo_owner,
                    repo_name: pr.key.repo_name,
                    pr_number: pr.key.pr_number,
                    revision: pr.revision.short().to_string(),
                    lifecycle: pr.lifecycle,
                    merge_ready: gate.merge_ready,
                    approvals: gate.approvals,
                    required_approvals: gate.required_approvals,
                    reviewers: pr.requirement.reviewers.into_iter().collect(),
                    invalid_reviewers: pr.invalid_reviewers.into_iter().collect(),
                    workflows: pr
                        .runs
                        .into_iter()
                        .map(|run| WorkflowStatusEntry {
                            workflow: run.workflow,
                            status: run.status,
                            attempts: run.attempts,
                        })
                        .collect(),
                    unsatisfied: gate.unsatisfied.iter().map(|u| u.to_string()).collect(),
                }
            })
            .collect();

        Self {
            version,
            summary,
            prs,
        }
    }
}

/// Check `Authorization: Bearer <token>` against the configured token.
#[allow(clippy::result_large_err)]
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::FORBIDDEN,
            "Status endpoint is disabled (STATUS_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(provided) if provided == expected_token => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

fn internal_error(context: &str, e: GateError) -> Response {
    error!("{}: {}", context, e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Failed to read tracker state").into_response()
}

/// Handler: GET /status
pub async fn status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusData>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;

    let states = state
        .service
        .store()
        .get_all()
        .await
        .map_err(|e| internal_error("Failed to list tracked PRs", e))?;

    Ok(Json(StatusData::from_states(
        states,
        crate::get_version(),
    )))
}

/// Handler: GET /gate/{owner}/{repo}/{number}
pub async fn gate_handler(
    State(state): State<Arc<AppState>>,
    Path((owner, repo, number)): Path<(String, String, u64)>,
) -> Result<Json<GateDecision>, Response> {
    let key = PrKey::new(owner, repo, number);
    match state.service.store().current_gate_state(&key).await {
        Ok(decision) => Ok(Json(decision)),
        Err(GateError::UnknownPullRequest { .. }) => {
            Err((StatusCode::NOT_FOUND, format!("{} is not tracked", key)).into_response())
        }
        Err(e) => Err(internal_error("Failed to evaluate gate", e)),
    }
}

pub fn status_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/gate/:owner/:repo/:number", get(gate_handler))
}
