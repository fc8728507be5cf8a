//! Effects (side effects as data).
//!
//! Effects describe what should happen as a result of a transition. The
//! interpreter executes them; the transition function never performs I/O.

use reviewgate_core::{CommitSha, Login};
use serde::{Deserialize, Serialize};

use crate::platform::GateStatusState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    /// Ask the platform to request each reviewer (one dispatch per login).
    RequestReviewers {
        revision: CommitSha,
        reviewers: Vec<Login>,
    },

    /// Trigger a workflow run for `revision` on the PR's source branch.
    TriggerWorkflow {
        workflow: String,
        revision: CommitSha,
        git_ref: String,
    },

    /// Publish the merge gate as a commit status on `revision`.
    PublishGateStatus {
        revision: CommitSha,
        state: GateStatusState,
        description: String,
    },

    /// Cancel every in-flight dispatch for the PR.
    CancelDispatches,

    Log { level: LogLevel, message: String },
}

/// Log level for logging effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}
