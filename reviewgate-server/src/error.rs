//! Error taxonomy for event handling and dispatch.
//!
//! Everything that can reach an operator names the pull request and, where
//! one applies, the head revision.

use std::collections::BTreeMap;

use reviewgate_core::{CommitSha, Login, PrKey};
use thiserror::Error;

use crate::platform::PlatformError;
use crate::state_machine::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum GateError {
    /// The envelope did not match the expected schema. Discarded, never retried.
    #[error("malformed {event_type} event: {message}")]
    MalformedEvent { event_type: String, message: String },

    /// A mutation arrived for a PR that was never registered.
    #[error("{key}: pull request is not tracked")]
    UnknownPullRequest { key: PrKey },

    #[error("{key}@{}: reviewer {login} was rejected: {message}", .revision.short())]
    InvalidReviewer {
        key: PrKey,
        revision: CommitSha,
        login: Login,
        message: String,
    },

    #[error("{key}@{}: workflow {workflow} was rejected: {message}", .revision.short())]
    InvalidWorkflowRef {
        key: PrKey,
        revision: CommitSha,
        workflow: String,
        message: String,
    },

    #[error("{key}@{}: dispatching {target} failed (attempt {attempt}): {message}", .revision.short())]
    TransientDispatchFailure {
        key: PrKey,
        revision: CommitSha,
        target: String,
        attempt: u32,
        message: String,
    },

    #[error("{key}@{}: rules disagree on required approvals {counts:?}, using {chosen}", .revision.short())]
    PolicyResolutionConflict {
        key: PrKey,
        revision: CommitSha,
        counts: BTreeMap<String, u32>,
        chosen: u32,
    },

    /// Fetching the PR from the platform for (re-)registration failed.
    #[error("{key}: failed to fetch pull request: {source}")]
    Registration {
        key: PrKey,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl GateError {
    pub fn malformed(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedEvent {
            event_type: event_type.into(),
            message: message.into(),
        }
    }

    /// Whether redelivering the same event could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Registration { source, .. } => source.is_transient(),
            Self::Repository(_) | Self::TransientDispatchFailure { .. } => true,
            _ => false,
        }
    }
}
