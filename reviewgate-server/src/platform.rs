//! The hosting platform as seen by the dispatcher and the interpreter.
//!
//! `GitHubClient` is the production implementation; tests substitute a
//! scripted fake.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reviewgate_core::{CommitSha, Login, PrKey, PullRequestSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-call context: which installation to authenticate as, and the
/// correlation ID of the webhook that caused the call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub installation_id: u64,
    pub correlation_id: Option<String>,
}

impl CallContext {
    pub fn new(installation_id: u64, correlation_id: Option<String>) -> Self {
        Self {
            installation_id,
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// Network failure, 5xx or rate limiting. Safe to retry.
    #[error("transient platform failure: {0}")]
    Transient(String),

    /// The platform understood and refused the request.
    #[error("platform rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("unexpected platform response: {0}")]
    Unexpected(String),
}

impl PlatformError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 429 || status >= 500 {
            Self::Transient(format!("{}: {}", status, message))
        } else {
            Self::Rejected { status, message }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// State of the merge gate commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatusState {
    Success,
    Pending,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitStatus {
    pub state: GateStatusState,
    pub description: String,
    pub context: String,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn request_reviewers(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        reviewers: &[Login],
        idempotency_key: &str,
    ) -> Result<(), PlatformError>;

    /// Trigger a `workflow_dispatch` run of `workflow` on `git_ref`.
    async fn trigger_workflow(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        workflow: &str,
        git_ref: &str,
        revision: &CommitSha,
        idempotency_key: &str,
    ) -> Result<(), PlatformError>;

    /// Current state of a PR, including its changed files.
    async fn get_pull_request(
        &self,
        ctx: &CallContext,
        key: &PrKey,
    ) -> Result<PullRequestSnapshot, PlatformError>;

    async fn list_changed_files(
        &self,
        ctx: &CallContext,
        key: &PrKey,
    ) -> Result<BTreeSet<String>, PlatformError>;

    async fn create_commit_status(
        &self,
        ctx: &CallContext,
        key: &PrKey,
        sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(PlatformError::from_status(503, "unavailable").is_transient());
        assert!(PlatformError::from_status(502, "bad gateway").is_transient());
        assert!(PlatformError::from_status(429, "slow down").is_transient());
        assert_eq!(
            PlatformError::from_status(422, "not a collaborator"),
            PlatformError::Rejected {
                status: 422,
                message: "not a collaborator".to_string()
            }
        );
        assert!(!PlatformError::from_status(404, "missing").is_transient());
    }

    #[test]
    fn test_gate_status_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&GateStatusState::Success).unwrap(),
            "\"success\""
        );
    }
}
