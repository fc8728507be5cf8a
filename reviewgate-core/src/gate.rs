//! Merge gate evaluation.
//!
//! A PR is merge-ready iff the number of distinct reviewers whose latest
//! decision is "approve" is at least the required count, and every required
//! workflow run has succeeded. Evaluation is a pure read.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::model::{
    ApprovalRecord, Login, PrLifecycle, ReviewDecision, ReviewRequirement, RunStatus, WorkflowRun,
};

/// Everything the evaluator needs to know about one PR.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    pub requirement: &'a ReviewRequirement,
    pub approvals: &'a [ApprovalRecord],
    pub runs: &'a [WorkflowRun],
    pub author: &'a Login,
    pub invalid_reviewers: &'a BTreeSet<Login>,
}

/// Something that is not (yet) satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Unsatisfied {
    /// Not enough approvals. `awaiting` lists required reviewers without a
    /// current approval.
    Approvals {
        have: u32,
        need: u32,
        awaiting: Vec<Login>,
    },
    /// Informational; does not block the gate on its own.
    ChangesRequested { reviewer: Login },
    WorkflowPending { workflow: String, status: RunStatus },
    WorkflowFailed { workflow: String, attempts: u32 },
    /// Informational; the platform rejected this login.
    InvalidReviewer { login: Login },
}

impl Unsatisfied {
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Self::Approvals { .. } | Self::WorkflowPending { .. } | Self::WorkflowFailed { .. }
        )
    }
}

impl fmt::Display for Unsatisfied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approvals {
                have,
                need,
                awaiting,
            } => {
                write!(f, "{} of {} required approvals", have, need)?;
                if !awaiting.is_empty() {
                    let names: Vec<&str> = awaiting.iter().map(Login::as_str).collect();
                    write!(f, " (awaiting {})", names.join(", "))?;
                }
                Ok(())
            }
            Self::ChangesRequested { reviewer } => {
                write!(f, "{} requested changes", reviewer)
            }
            Self::WorkflowPending { workflow, status } => {
                write!(f, "workflow {} is {}", workflow, status)
            }
            Self::WorkflowFailed { workflow, attempts } => {
                write!(f, "workflow {} failed after {} attempt(s)", workflow, attempts)
            }
            Self::InvalidReviewer { login } => {
                write!(f, "reviewer {} could not be requested", login)
            }
        }
    }
}

/// Result of evaluating the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub merge_ready: bool,
    pub approvals: u32,
    pub required_approvals: u32,
    pub unsatisfied: Vec<Unsatisfied>,
}

impl GateDecision {
    /// Lifecycle phase implied by this decision for an open PR.
    pub fn phase(&self) -> PrLifecycle {
        if self.approvals < self.required_approvals {
            PrLifecycle::AwaitingApprovals
        } else if !self.merge_ready {
            PrLifecycle::AwaitingChecks
        } else {
            PrLifecycle::Ready
        }
    }

    pub fn has_failed_workflow(&self) -> bool {
        self.unsatisfied
            .iter()
            .any(|u| matches!(u, Unsatisfied::WorkflowFailed { .. }))
    }

    /// One-line human readable summary.
    pub fn summary(&self) -> String {
        if self.merge_ready {
            return format!(
                "Ready to merge ({} of {} approvals)",
                self.approvals, self.required_approvals
            );
        }
        let blocking: Vec<String> = self
            .unsatisfied
            .iter()
            .filter(|u| u.is_blocking())
            .map(ToString::to_string)
            .collect();
        format!("Blocked: {}", blocking.join("; "))
    }
}

/// Latest record per reviewer, excluding the author.
pub fn latest_decisions<'a>(
    approvals: &'a [ApprovalRecord],
    author: &Login,
) -> BTreeMap<&'a Login, &'a ApprovalRecord> {
    let mut latest: BTreeMap<&Login, &ApprovalRecord> = BTreeMap::new();
    for record in approvals.iter().filter(|r| &r.reviewer != author) {
        match latest.get(&record.reviewer) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                latest.insert(&record.reviewer, record);
            }
        }
    }
    latest
}

pub fn evaluate(input: &GateInput<'_>) -> GateDecision {
    let latest = latest_decisions(input.approvals, input.author);

    let approvers: BTreeSet<&Login> = latest
        .iter()
        .filter(|(_, r)| r.decision == ReviewDecision::Approve)
        .map(|(login, _)| *login)
        .collect();
    let approvals = u32::try_from(approvers.len()).unwrap_or(u32::MAX);
    let need = input.requirement.required_approvals;

    let mut unsatisfied = Vec::new();

    if approvals < need {
        let awaiting = input
            .requirement
            .reviewers
            .iter()
            .filter(|r| !approvers.contains(r))
            .cloned()
            .collect();
        unsatisfied.push(Unsatisfied::Approvals {
            have: approvals,
            need,
            awaiting,
        });
    }

    for (login, record) in &latest {
        if record.decision == ReviewDecision::RequestChanges {
            unsatisfied.push(Unsatisfied::ChangesRequested {
                reviewer: (*login).clone(),
            });
        }
    }

    let mut checks_ok = true;
    for run in input.runs {
        match run.status {
            RunStatus::Succeeded => {}
            RunStatus::Failed => {
                checks_ok = false;
                unsatisfied.push(Unsatisfied::WorkflowFailed {
                    workflow: run.workflow.clone(),
                    attempts: run.attempts,
                });
            }
            status => {
                checks_ok = false;
                unsatisfied.push(Unsatisfied::WorkflowPending {
                    workflow: run.workflow.clone(),
                    status,
                });
            }
        }
    }

    for login in input.invalid_reviewers {
        unsatisfied.push(Unsatisfied::InvalidReviewer {
            login: login.clone(),
        });
    }

    GateDecision {
        merge_ready: approvals >= need && checks_ok,
        approvals,
        required_approvals: need,
        unsatisfied,
    }
}
