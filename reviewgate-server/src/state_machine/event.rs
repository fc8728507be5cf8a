//! Events that drive the tracker.
//!
//! The first group comes from webhooks, the second is fed back by the
//! dispatcher as its tasks make progress.

use reviewgate_core::policy::Resolution;
use reviewgate_core::{ApprovalRecord, CommitSha, Login, PullRequestSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    // =========================================================================
    // Webhook Events
    // =========================================================================
    /// PR opened, reopened, marked ready or pushed to. The resolution is
    /// computed from `snapshot` against the policy current at arrival.
    PrOpened {
        snapshot: PullRequestSnapshot,
        installation_id: u64,
        resolution: Resolution,
    },

    ReviewSubmitted { review: ApprovalRecord },

    WorkflowCompleted {
        workflow: String,
        revision: CommitSha,
        run_id: u64,
        run_attempt: u32,
        succeeded: bool,
    },

    PrClosed { merged: bool },

    // =========================================================================
    // Dispatch Feedback
    // =========================================================================
    ReviewerRequested { revision: CommitSha, reviewer: Login },

    /// The platform refused the reviewer (4xx).
    ReviewerRejected {
        revision: CommitSha,
        reviewer: Login,
        message: String,
    },

    WorkflowDispatched {
        workflow: String,
        revision: CommitSha,
        attempts: u32,
    },

    /// A trigger attempt failed transiently; another attempt is scheduled.
    WorkflowDispatchRetrying {
        workflow: String,
        revision: CommitSha,
        attempts: u32,
        message: String,
    },

    /// The trigger was refused or the retry budget ran out.
    WorkflowDispatchFailed {
        workflow: String,
        revision: CommitSha,
        attempts: u32,
        message: String,
        /// The platform refused the reference, as opposed to retries running out.
        rejected: bool,
    },
}

impl Event {
    /// Key under which this event is applied at most once per PR, if it is
    /// a mutation that needs deduplication.
    pub fn idempotency_key(&self) -> Option<String> {
        match self {
            Self::ReviewSubmitted { review } => Some(format!(
                "review:{}:{}:{}:{}",
                review.reviewer, review.review_id, review.decision, review.revision
            )),
            Self::WorkflowCompleted {
                workflow,
                revision,
                run_id,
                run_attempt,
                ..
            } => Some(format!(
                "run:{}:{}:{}:{}",
                workflow, revision, run_id, run_attempt
            )),
            _ => None,
        }
    }

    /// True for events that require the PR to be registered already.
    pub fn requires_registration(&self) -> bool {
        matches!(
            self,
            Self::ReviewSubmitted { .. } | Self::WorkflowCompleted { .. }
        )
    }

    /// Short human-readable summary for logging.
    pub fn log_summary(&self) -> String {
        match self {
            Self::PrOpened { snapshot, .. } => {
                format!("PrOpened({})", snapshot.revision.short())
            }
            Self::ReviewSubmitted { review } => {
                format!("ReviewSubmitted({} {})", review.reviewer, review.decision)
            }
            Self::WorkflowCompleted {
                workflow,
                run_id,
                run_attempt,
                succeeded,
                ..
            } => format!(
                "WorkflowCompleted({} run {}#{} succeeded={})",
                workflow, run_id, run_attempt, succeeded
            ),
            Self::PrClosed { merged } => format!("PrClosed(merged={})", merged),
            Self::ReviewerRequested { reviewer, .. } => format!("ReviewerRequested({})", reviewer),
            Self::ReviewerRejected { reviewer, .. } => format!("ReviewerRejected({})", reviewer),
            Self::WorkflowDispatched {
                workflow, attempts, ..
            } => format!("WorkflowDispatched({} attempt {})", workflow, attempts),
            Self::WorkflowDispatchRetrying {
                workflow, attempts, ..
            } => format!("WorkflowDispatchRetrying({} attempt {})", workflow, attempts),
            Self::WorkflowDispatchFailed {
                workflow, attempts, ..
            } => format!("WorkflowDispatchFailed({} after {})", workflow, attempts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reviewgate_core::ReviewDecision;

    #[test]
    fn test_review_key_distinguishes_decision_and_id() {
        let review = |id, decision| Event::ReviewSubmitted {
            review: ApprovalRecord {
                reviewer: Login::new("alice"),
                review_id: id,
                revision: CommitSha::from("abc"),
                submitted_at: Utc::now(),
                decision,
            },
        };
        let approve = review(1, ReviewDecision::Approve).idempotency_key();
        let dismissed = review(1, ReviewDecision::Dismissed).idempotency_key();
        let other = review(2, ReviewDecision::Approve).idempotency_key();
        assert_ne!(approve, dismissed);
        assert_ne!(approve, other);
        assert_eq!(approve, review(1, ReviewDecision::Approve).idempotency_key());
    }

    #[test]
    fn test_feedback_events_are_not_deduplicated() {
        let event = Event::WorkflowDispatched {
            workflow: "plan.yml".to_string(),
            revision: CommitSha::from("abc"),
            attempts: 1,
        };
        assert_eq!(event.idempotency_key(), None);
        assert!(!event.requires_registration());
    }
}
