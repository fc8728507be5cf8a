//! Pure transition function: `(state, event) -> (state, effects)`.
//!
//! `None` is an untracked PR. A returned state with a terminal lifecycle
//! means the PR is finished and the store evicts it.

use reviewgate_core::policy::Resolution;
use reviewgate_core::{
    CommitSha, PrKey, PrLifecycle, PullRequestSnapshot, RunStatus, WorkflowRun,
};

use super::effect::{Effect, LogLevel};
use super::event::Event;
use super::state::TrackedPullRequest;
use crate::error::GateError;
use crate::platform::GateStatusState;

/// GitHub truncates commit status descriptions beyond this.
const MAX_STATUS_DESCRIPTION: usize = 140;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub state: Option<TrackedPullRequest>,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    fn unchanged(state: Option<TrackedPullRequest>) -> Self {
        Self {
            state,
            effects: Vec::new(),
        }
    }

    fn ignored(state: Option<TrackedPullRequest>, message: String) -> Self {
        Self {
            state,
            effects: vec![log(LogLevel::Debug, message)],
        }
    }
}

fn log(level: LogLevel, message: impl Into<String>) -> Effect {
    Effect::Log {
        level,
        message: message.into(),
    }
}

pub fn transition(
    key: &PrKey,
    state: Option<TrackedPullRequest>,
    event: Event,
) -> Result<TransitionResult, GateError> {
    let Some(mut pr) = state else {
        return match event {
            Event::PrOpened {
                snapshot,
                installation_id,
                resolution,
            } => Ok(register(snapshot, installation_id, resolution)),
            event if event.requires_registration() => {
                Err(GateError::UnknownPullRequest { key: key.clone() })
            }
            event => Ok(TransitionResult::ignored(
                None,
                format!("{}: ignoring {} for untracked PR", key, event.log_summary()),
            )),
        };
    };

    if let Some(idempotency_key) = event.idempotency_key() {
        if pr.applied.contains(&idempotency_key) {
            return Ok(TransitionResult::ignored(
                Some(pr),
                format!("{}: already applied {}", key, idempotency_key),
            ));
        }
        pr.applied.insert(idempotency_key);
    }

    let before = gate_status(&pr);
    let mut effects = Vec::new();

    match event {
        Event::PrOpened {
            snapshot,
            installation_id,
            resolution,
        } => {
            if snapshot.revision == pr.revision {
                return Ok(TransitionResult::ignored(
                    Some(pr),
                    format!("{}: revision already registered", snapshot.key),
                ));
            }
            pr.installation_id = installation_id;
            new_revision(&mut pr, snapshot, resolution, &mut effects);
            pr.refresh_lifecycle();
            effects.push(publish(&pr));
            return Ok(TransitionResult {
                state: Some(pr),
                effects,
            });
        }

        Event::ReviewSubmitted { review } => {
            if review.reviewer == pr.author {
                effects.push(log(
                    LogLevel::Debug,
                    format!("{}: ignoring self-review by {}", pr.label(), review.reviewer),
                ));
                return Ok(TransitionResult {
                    state: Some(pr),
                    effects,
                });
            }
            effects.push(log(
                LogLevel::Info,
                format!(
                    "{}: {} recorded {} (review {})",
                    pr.label(),
                    review.reviewer,
                    review.decision,
                    review.review_id
                ),
            ));
            pr.approvals.push(review);
        }

        Event::WorkflowCompleted {
            workflow,
            revision,
            run_id,
            run_attempt,
            succeeded,
        } => {
            if revision != pr.revision {
                return Ok(TransitionResult::ignored(
                    Some(pr),
                    format!(
                        "{}: ignoring {} completion for stale revision {}",
                        key,
                        workflow,
                        revision.short()
                    ),
                ));
            }
            let label = pr.label();
            let Some(run) = pr.run_mut(&workflow) else {
                return Ok(TransitionResult::ignored(
                    Some(pr),
                    format!("{}: {} is not a required workflow", label, workflow),
                ));
            };
            let completion = (run_id, run_attempt);
            if run.completion.is_some_and(|seen| seen >= completion) {
                return Ok(TransitionResult::ignored(
                    Some(pr),
                    format!(
                        "{}: ignoring older completion of {} (run {}#{})",
                        label, workflow, run_id, run_attempt
                    ),
                ));
            }
            run.completion = Some(completion);
            run.status = if succeeded {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            };
            effects.push(log(
                LogLevel::Info,
                format!("{}: workflow {} {}", label, workflow, run.status),
            ));
        }

        Event::PrClosed { merged } => {
            pr.lifecycle = if merged {
                PrLifecycle::Merged
            } else {
                PrLifecycle::Closed
            };
            effects.push(Effect::CancelDispatches);
            effects.push(log(
                LogLevel::Info,
                format!("{}: {}, no longer tracked", pr.label(), pr.lifecycle),
            ));
            return Ok(TransitionResult {
                state: Some(pr),
                effects,
            });
        }

        Event::ReviewerRequested { reviewer, .. } => {
            pr.requested_reviewers.insert(reviewer);
            return Ok(TransitionResult::unchanged(Some(pr)));
        }

        Event::ReviewerRejected {
            revision,
            reviewer,
            message,
        } => {
            let err = GateError::InvalidReviewer {
                key: pr.key.clone(),
                revision,
                login: reviewer.clone(),
                message,
            };
            effects.push(log(LogLevel::Warn, err.to_string()));
            pr.invalid_reviewers.insert(reviewer);
        }

        Event::WorkflowDispatched {
            workflow,
            revision,
            attempts,
        } => {
            if let Some(run) = current_run(&mut pr, &workflow, &revision) {
                run.status = RunStatus::Running;
                run.attempts = attempts;
            }
        }

        Event::WorkflowDispatchRetrying {
            workflow,
            revision,
            attempts,
            message,
        } => {
            let err = GateError::TransientDispatchFailure {
                key: pr.key.clone(),
                revision: revision.clone(),
                target: workflow.clone(),
                attempt: attempts,
                message,
            };
            if let Some(run) = current_run(&mut pr, &workflow, &revision) {
                run.status = RunStatus::Retried;
                run.attempts = attempts;
                effects.push(log(LogLevel::Warn, err.to_string()));
            }
        }

        Event::WorkflowDispatchFailed {
            workflow,
            revision,
            attempts,
            message,
            rejected,
        } => {
            let err = if rejected {
                GateError::InvalidWorkflowRef {
                    key: pr.key.clone(),
                    revision: revision.clone(),
                    workflow: workflow.clone(),
                    message,
                }
            } else {
                GateError::TransientDispatchFailure {
                    key: pr.key.clone(),
                    revision: revision.clone(),
                    target: workflow.clone(),
                    attempt: attempts,
                    message: format!("retries exhausted: {}", message),
                }
            };
            if let Some(run) = current_run(&mut pr, &workflow, &revision) {
                run.status = RunStatus::Failed;
                run.attempts = attempts;
                effects.push(log(LogLevel::Error, err.to_string()));
            }
        }
    }

    pr.refresh_lifecycle();
    if gate_status(&pr) != before {
        effects.push(publish(&pr));
    }

    Ok(TransitionResult {
        state: Some(pr),
        effects,
    })
}

/// The run of `workflow` for the current revision, if it has not finished.
fn current_run<'a>(
    pr: &'a mut TrackedPullRequest,
    workflow: &str,
    revision: &CommitSha,
) -> Option<&'a mut WorkflowRun> {
    if &pr.revision != revision {
        return None;
    }
    pr.run_mut(workflow)
        .filter(|run| run.completion.is_none() && !run.status.is_terminal())
}

fn register(
    snapshot: PullRequestSnapshot,
    installation_id: u64,
    resolution: Resolution,
) -> TransitionResult {
    let mut pr = TrackedPullRequest {
        key: snapshot.key.clone(),
        installation_id,
        revision: snapshot.revision.clone(),
        source_branch: snapshot.source_branch.clone(),
        target_branch: snapshot.target_branch.clone(),
        author: snapshot.author.clone(),
        changed_files: snapshot.changed_files.clone(),
        lifecycle: PrLifecycle::Open,
        requirement: Default::default(),
        workflows: Vec::new(),
        runs: Vec::new(),
        approvals: Vec::new(),
        requested_reviewers: Default::default(),
        invalid_reviewers: Default::default(),
        applied: Default::default(),
    };

    let mut effects = Vec::new();
    adopt_resolution(&mut pr, resolution, &mut effects);
    effects.push(log(
        LogLevel::Info,
        format!(
            "{}: registered, {} approval(s) from {:?}, workflows {:?}",
            pr.label(),
            pr.requirement.required_approvals,
            pr.requirement
                .reviewers
                .iter()
                .map(|r| r.as_str())
                .collect::<Vec<_>>(),
            pr.workflows
        ),
    ));
    dispatch_all(&pr, &mut effects);
    pr.refresh_lifecycle();
    effects.push(publish(&pr));

    TransitionResult {
        state: Some(pr),
        effects,
    }
}

fn new_revision(
    pr: &mut TrackedPullRequest,
    snapshot: PullRequestSnapshot,
    resolution: Resolution,
    effects: &mut Vec<Effect>,
) {
    let previous = pr.revision.clone();
    let scope_changed = snapshot.changed_files != pr.changed_files
        || snapshot.target_branch != pr.target_branch;

    pr.revision = snapshot.revision;
    pr.source_branch = snapshot.source_branch;
    pr.target_branch = snapshot.target_branch;
    pr.changed_files = snapshot.changed_files;

    effects.push(Effect::CancelDispatches);
    effects.push(log(
        LogLevel::Info,
        format!(
            "{}: new revision (was {}){}",
            pr.label(),
            previous.short(),
            if scope_changed {
                ", recomputing requirements"
            } else {
                ""
            }
        ),
    ));

    if scope_changed {
        adopt_resolution(pr, resolution, effects);
    } else {
        pr.runs = pr
            .workflows
            .iter()
            .map(|w| WorkflowRun::pending(w.clone(), pr.revision.clone()))
            .collect();
    }

    dispatch_all(pr, effects);
}

fn adopt_resolution(pr: &mut TrackedPullRequest, resolution: Resolution, effects: &mut Vec<Effect>) {
    if let Some(conflict) = resolution.conflict {
        let err = GateError::PolicyResolutionConflict {
            key: pr.key.clone(),
            revision: pr.revision.clone(),
            counts: conflict.counts,
            chosen: conflict.chosen,
        };
        effects.push(log(LogLevel::Warn, err.to_string()));
    }
    pr.requirement = resolution.requirement;
    pr.workflows = resolution.workflows;
    pr.runs = pr
        .workflows
        .iter()
        .map(|w| WorkflowRun::pending(w.clone(), pr.revision.clone()))
        .collect();
}

fn dispatch_all(pr: &TrackedPullRequest, effects: &mut Vec<Effect>) {
    let reviewers = pr.unrequested_reviewers();
    if !reviewers.is_empty() {
        effects.push(Effect::RequestReviewers {
            revision: pr.revision.clone(),
            reviewers,
        });
    }
    for workflow in &pr.workflows {
        effects.push(Effect::TriggerWorkflow {
            workflow: workflow.clone(),
            revision: pr.revision.clone(),
            git_ref: pr.source_branch.clone(),
        });
    }
}

fn gate_status(pr: &TrackedPullRequest) -> (GateStatusState, String) {
    let decision = pr.gate();
    let state = if decision.merge_ready {
        GateStatusState::Success
    } else if decision.has_failed_workflow() {
        GateStatusState::Failure
    } else {
        GateStatusState::Pending
    };
    let mut description = decision.summary();
    if description.chars().count() > MAX_STATUS_DESCRIPTION {
        description = description
            .chars()
            .take(MAX_STATUS_DESCRIPTION - 3)
            .collect::<String>()
            + "...";
    }
    (state, description)
}

fn publish(pr: &TrackedPullRequest) -> Effect {
    let (state, description) = gate_status(pr);
    Effect::PublishGateStatus {
        revision: pr.revision.clone(),
        state,
        description,
    }
}
