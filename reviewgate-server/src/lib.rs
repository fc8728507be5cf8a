pub mod config;
pub mod dispatcher;
pub mod error;
pub mod github;
pub mod ingress;
pub mod platform;
pub mod recording;
pub mod service;
pub mod state_machine;
pub mod status;
pub mod webhook;

use std::sync::Arc;

use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use error::GateError;
pub use github::GitHubClient;
pub use recording::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Sanitizer,
};
pub use service::GateService;
pub use state_machine::StateStore;

/// Commit status context carrying the merge gate verdict.
pub const GATE_STATUS_CONTEXT: &str = "reviewgate/merge-gate";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

fn short_hash(git_hash: &str) -> String {
    git_hash.chars().take(8).collect()
}

pub fn get_version() -> String {
    // Packaging environments export the hash; cargo builds fall back to git.
    if let Some(git_hash) = option_env!("REVIEWGATE_GIT_HASH") {
        short_hash(git_hash)
    } else if let Some(git_hash) = built_info::GIT_COMMIT_HASH {
        short_hash(git_hash)
    } else {
        "unknown".to_string()
    }
}

pub struct AppState {
    pub service: Arc<GateService>,
    pub webhook_secret: String,
    pub status_auth_token: Option<String>,
    pub recording_logger: Option<RecordingLogger>,
}

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "reviewgate",
        "version": get_version(),
    })))
}

/// Every HTTP route the service exposes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .merge(status::status_router())
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
