//! Tracked state of a single pull request.

use std::collections::BTreeSet;

use reviewgate_core::{
    evaluate, ApprovalRecord, CommitSha, GateDecision, GateInput, Login, PrKey, PrLifecycle,
    ReviewRequirement, WorkflowRun,
};
use serde::{Deserialize, Serialize};

/// Everything the tracker knows about one open PR.
///
/// Approvals survive new revisions; workflow runs belong to the current
/// revision only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedPullRequest {
    pub key: PrKey,
    /// Needed to authenticate follow-up calls after a restart.
    pub installation_id: u64,
    pub revision: CommitSha,
    pub source_branch: String,
    pub target_branch: String,
    pub author: Login,
    pub changed_files: BTreeSet<String>,
    pub lifecycle: PrLifecycle,
    pub requirement: ReviewRequirement,
    /// Required workflows in dispatch order.
    pub workflows: Vec<String>,
    pub runs: Vec<WorkflowRun>,
    /// Append-only review log.
    pub approvals: Vec<ApprovalRecord>,
    /// Reviewers the platform has accepted a request for.
    #[serde(default)]
    pub requested_reviewers: BTreeSet<Login>,
    /// Reviewers the platform refused.
    #[serde(default)]
    pub invalid_reviewers: BTreeSet<Login>,
    /// Idempotency keys of mutations already applied.
    #[serde(default)]
    pub applied: BTreeSet<String>,
}

impl TrackedPullRequest {
    pub fn gate(&self) -> GateDecision {
        evaluate(&GateInput {
            requirement: &self.requirement,
            approvals: &self.approvals,
            runs: &self.runs,
            author: &self.author,
            invalid_reviewers: &self.invalid_reviewers,
        })
    }

    pub fn run_mut(&mut self, workflow: &str) -> Option<&mut WorkflowRun> {
        self.runs.iter_mut().find(|run| run.workflow == workflow)
    }

    pub fn run(&self, workflow: &str) -> Option<&WorkflowRun> {
        self.runs.iter().find(|run| run.workflow == workflow)
    }

    /// Required reviewers that have neither been requested nor refused.
    pub fn unrequested_reviewers(&self) -> Vec<Login> {
        self.requirement
            .reviewers
            .iter()
            .filter(|r| !self.requested_reviewers.contains(*r) && !self.invalid_reviewers.contains(*r))
            .cloned()
            .collect()
    }

    /// Re-derive the lifecycle phase from the gate unless the PR is finished.
    pub fn refresh_lifecycle(&mut self) {
        if !self.lifecycle.is_terminal() {
            self.lifecycle = self.gate().phase();
        }
    }

    /// `owner/repo#n@sha` for log lines.
    pub fn label(&self) -> String {
        format!("{}@{}", self.key, self.revision.short())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::tracked;
    use super::*;
    use reviewgate_core::RunStatus;

    #[test]
    fn test_refresh_lifecycle_follows_gate() {
        let mut pr = tracked(&["alice"], 1, &["plan.yml"]);
        pr.refresh_lifecycle();
        assert_eq!(pr.lifecycle, PrLifecycle::AwaitingApprovals);

        pr.requirement.required_approvals = 0;
        pr.refresh_lifecycle();
        assert_eq!(pr.lifecycle, PrLifecycle::AwaitingChecks);

        pr.run_mut("plan.yml").unwrap().status = RunStatus::Succeeded;
        pr.refresh_lifecycle();
        assert_eq!(pr.lifecycle, PrLifecycle::Ready);
    }

    #[test]
    fn test_terminal_lifecycle_is_sticky() {
        let mut pr = tracked(&[], 0, &[]);
        pr.lifecycle = PrLifecycle::Merged;
        pr.refresh_lifecycle();
        assert_eq!(pr.lifecycle, PrLifecycle::Merged);
    }

    #[test]
    fn test_unrequested_reviewers_skips_requested_and_invalid() {
        let mut pr = tracked(&["alice", "bob", "carol"], 1, &[]);
        pr.requested_reviewers.insert(Login::new("alice"));
        pr.invalid_reviewers.insert(Login::new("carol"));
        assert_eq!(pr.unrequested_reviewers(), vec![Login::new("bob")]);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let pr = tracked(&["alice"], 1, &["plan.yml"]);
        let json = serde_json::to_string(&pr).unwrap();
        let back: TrackedPullRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pr);
    }
}
