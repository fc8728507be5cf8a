//! End-to-end flows: normalized events through the tracker, dispatcher and
//! feedback loop against a scripted platform.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reviewgate_core::{
    ApprovalRecord, CommitSha, Login, PolicyHandle, PolicySet, PrKey, PrLifecycle,
    PullRequestSnapshot, PullRequestState, ReviewDecision, RunStatus,
};
use reviewgate_server::dispatcher::{DispatchConfig, Dispatcher};
use reviewgate_server::ingress::NormalizedEvent;
use reviewgate_server::platform::{
    CallContext, CommitStatus, GateStatusState, Platform, PlatformError,
};
use reviewgate_server::state_machine::repository::InMemoryRepository;
use reviewgate_server::{GateService, StateStore};
use tokio::sync::mpsc;

const REVISION: &str = "abc1234567";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    RequestReviewer { login: String, ok: bool },
    TriggerWorkflow { workflow: String, ok: bool },
    GetPullRequest,
    Status(GateStatusState),
}

#[derive(Default)]
struct ScriptedPlatform {
    files: BTreeSet<String>,
    /// Transient failures to serve before succeeding, per reviewer login.
    reviewer_failures: Mutex<HashMap<String, u32>>,
    workflows_always_fail: bool,
    /// What `get_pull_request` reports.
    state: Mutex<PullRequestState>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedPlatform {
    fn touching(files: &[&str]) -> Self {
        Self {
            files: files.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    fn failing_reviewer(self, login: &str, failures: u32) -> Self {
        self.reviewer_failures
            .lock()
            .unwrap()
            .insert(login.to_string(), failures);
        self
    }

    fn failing_workflows(mut self) -> Self {
        self.workflows_always_fail = true;
        self
    }

    fn set_state(&self, state: PullRequestState) {
        *self.state.lock().unwrap() = state;
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn reviewer_calls(&self, login: &str) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::RequestReviewer { login: l, ok } if l == login => Some(ok),
                _ => None,
            })
            .collect()
    }

    fn workflow_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::TriggerWorkflow { .. }))
            .count()
    }

    fn last_status(&self) -> Option<GateStatusState> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Status(state) => Some(state),
            _ => None,
        })
    }
}

#[async_trait]
impl Platform for ScriptedPlatform {
    async fn request_reviewers(
        &self,
        _ctx: &CallContext,
        _key: &PrKey,
        reviewers: &[Login],
        _idempotency_key: &str,
    ) -> Result<(), PlatformError> {
        let mut result = Ok(());
        for reviewer in reviewers {
            let mut failures = self.reviewer_failures.lock().unwrap();
            let ok = match failures.get_mut(reviewer.as_str()) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    false
                }
                _ => true,
            };
            if !ok {
                result = Err(PlatformError::Transient("503: unavailable".to_string()));
            }
            self.calls.lock().unwrap().push(Call::RequestReviewer {
                login: reviewer.to_string(),
                ok,
            });
        }
        result
    }

    async fn trigger_workflow(
        &self,
        _ctx: &CallContext,
        _key: &PrKey,
        workflow: &str,
        _git_ref: &str,
        _revision: &CommitSha,
        _idempotency_key: &str,
    ) -> Result<(), PlatformError> {
        let ok = !self.workflows_always_fail;
        self.calls.lock().unwrap().push(Call::TriggerWorkflow {
            workflow: workflow.to_string(),
            ok,
        });
        if ok {
            Ok(())
        } else {
            Err(PlatformError::Transient("503: unavailable".to_string()))
        }
    }

    async fn get_pull_request(
        &self,
        _ctx: &CallContext,
        key: &PrKey,
    ) -> Result<PullRequestSnapshot, PlatformError> {
        self.calls.lock().unwrap().push(Call::GetPullRequest);
        Ok(PullRequestSnapshot {
            key: key.clone(),
            revision: CommitSha::from(REVISION),
            source_branch: "feature/vpc".to_string(),
            target_branch: "main".to_string(),
            author: Login::new("author"),
            changed_files: self.files.clone(),
            state: *self.state.lock().unwrap(),
        })
    }

    async fn list_changed_files(
        &self,
        _ctx: &CallContext,
        _key: &PrKey,
    ) -> Result<BTreeSet<String>, PlatformError> {
        Ok(self.files.clone())
    }

    async fn create_commit_status(
        &self,
        _ctx: &CallContext,
        _key: &PrKey,
        _sha: &CommitSha,
        status: &CommitStatus,
    ) -> Result<(), PlatformError> {
        self.calls.lock().unwrap().push(Call::Status(status.state));
        Ok(())
    }
}

struct Harness {
    service: Arc<GateService>,
    dispatcher: Arc<Dispatcher>,
    platform: Arc<ScriptedPlatform>,
}

impl Harness {
    fn new(policy: &str, platform: ScriptedPlatform) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let platform = Arc::new(platform);
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            platform.clone(),
            repository.clone(),
            DispatchConfig::default(),
            tx,
        ));
        let store = Arc::new(StateStore::new(
            repository,
            platform.clone(),
            dispatcher.clone(),
        ));
        let policy = PolicyHandle::new(PolicySet::from_yaml_str(policy).unwrap());
        let service = Arc::new(GateService::new(store, platform.clone(), policy));
        tokio::spawn(service.clone().run_feedback_loop(rx));
        Self {
            service,
            dispatcher,
            platform,
        }
    }

    async fn send(&self, event: NormalizedEvent) {
        self.service
            .handle(event, Some("cid".to_string()))
            .await
            .unwrap();
    }

    /// Let every dispatch finish and its feedback land.
    async fn settle(&self) {
        self.dispatcher.drain().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn key() -> PrKey {
    PrKey::new("acme", "infra", 7)
}

fn opened() -> NormalizedEvent {
    opened_at(REVISION)
}

fn opened_at(revision: &str) -> NormalizedEvent {
    NormalizedEvent::PrOpened {
        key: key(),
        installation_id: 42,
        revision: CommitSha::from(revision),
        source_branch: "feature/vpc".to_string(),
        target_branch: "main".to_string(),
        author: Login::new("author"),
    }
}

fn approval(reviewer: &str, review_id: u64) -> NormalizedEvent {
    NormalizedEvent::ReviewSubmitted {
        key: key(),
        installation_id: 42,
        review: ApprovalRecord {
            reviewer: Login::new(reviewer),
            review_id,
            revision: CommitSha::from(REVISION),
            submitted_at: Utc::now(),
            decision: ReviewDecision::Approve,
        },
    }
}

fn closed(merged: bool) -> NormalizedEvent {
    NormalizedEvent::PrClosed {
        key: key(),
        installation_id: 42,
        merged,
    }
}

fn plan_completed(pr_number: Option<u64>, run_id: u64) -> NormalizedEvent {
    NormalizedEvent::WorkflowCompleted {
        repo_owner: "acme".to_string(),
        repo_name: "infra".to_string(),
        pr_number,
        installation_id: 42,
        workflow: "plan.yml".to_string(),
        revision: CommitSha::from(REVISION),
        run_id,
        run_attempt: 1,
        succeeded: true,
    }
}

fn logins(names: &[&str]) -> BTreeSet<Login> {
    names.iter().map(Login::new).collect()
}

const NESTED_POLICY: &str = r#"
rules:
  - name: modules
    path_pattern: "modules/**"
    reviewers: [alice]
    required_approvals: 1
  - name: network
    path_pattern: "modules/network/**"
    reviewers: [bob]
    required_approvals: 2
"#;

#[tokio::test(start_paused = true)]
async fn test_nested_rules_request_union_of_reviewers() {
    let h = Harness::new(
        NESTED_POLICY,
        ScriptedPlatform::touching(&["modules/network/vpc.tf"]),
    );

    h.send(opened()).await;
    h.settle().await;

    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.requirement.reviewers, logins(&["alice", "bob"]));
    assert_eq!(pr.requirement.required_approvals, 2);
    assert_eq!(pr.requested_reviewers, logins(&["alice", "bob"]));
    assert_eq!(pr.lifecycle, PrLifecycle::AwaitingApprovals);
    assert_eq!(h.platform.reviewer_calls("alice"), vec![true]);
    assert_eq!(h.platform.reviewer_calls("bob"), vec![true]);
    assert_eq!(h.platform.last_status(), Some(GateStatusState::Pending));
}

#[tokio::test(start_paused = true)]
async fn test_transient_reviewer_failure_is_retried_once() {
    let h = Harness::new(
        NESTED_POLICY,
        ScriptedPlatform::touching(&["modules/vpc.tf"]).failing_reviewer("alice", 1),
    );

    h.send(opened()).await;
    h.settle().await;

    // One refused attempt, exactly one successful request.
    assert_eq!(h.platform.reviewer_calls("alice"), vec![false, true]);
    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.requested_reviewers, logins(&["alice"]));

    // Redelivering the open event does not request again.
    h.send(opened()).await;
    h.settle().await;
    assert_eq!(h.platform.reviewer_calls("alice"), vec![false, true]);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_workflow_retry() {
    let policy = r#"
rules:
  - path_pattern: "modules/**"
    workflows: [plan.yml]
"#;
    let h = Harness::new(
        policy,
        ScriptedPlatform::touching(&["modules/vpc.tf"]).failing_workflows(),
    );

    h.send(opened()).await;
    // First attempt fails; the retry is waiting on its backoff.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.platform.workflow_calls(), 1);

    h.send(NormalizedEvent::PrClosed {
        key: key(),
        installation_id: 42,
        merged: false,
    })
    .await;
    let calls_at_close = h.platform.calls().len();

    h.settle().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.platform.workflow_calls(), 1);
    assert_eq!(h.platform.calls().len(), calls_at_close);
    assert!(h.service.store().get(&key()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_review_counts_once_and_gate_opens() {
    let policy = r#"
rules:
  - path_pattern: "**"
    reviewers: [alice, bob]
    required_approvals: 2
"#;
    let h = Harness::new(policy, ScriptedPlatform::touching(&["main.tf"]));

    h.send(opened()).await;
    h.send(approval("alice", 100)).await;
    h.send(approval("alice", 100)).await;
    h.settle().await;

    let gate = h.service.store().current_gate_state(&key()).await.unwrap();
    assert_eq!(gate.approvals, 1);
    assert!(!gate.merge_ready);

    h.send(approval("bob", 101)).await;
    h.settle().await;

    let gate = h.service.store().current_gate_state(&key()).await.unwrap();
    assert_eq!(gate.approvals, 2);
    assert!(gate.merge_ready);
    assert_eq!(h.platform.last_status(), Some(GateStatusState::Success));
}

#[tokio::test(start_paused = true)]
async fn test_review_for_untracked_pr_registers_it() {
    let policy = r#"
rules:
  - path_pattern: "modules/**"
    reviewers: [alice]
    required_approvals: 1
"#;
    let h = Harness::new(policy, ScriptedPlatform::touching(&["modules/vpc.tf"]));

    h.send(approval("alice", 100)).await;
    h.settle().await;

    assert!(h.platform.calls().contains(&Call::GetPullRequest));
    let gate = h.service.store().current_gate_state(&key()).await.unwrap();
    assert_eq!(gate.approvals, 1);
    assert!(gate.merge_ready);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_run_without_pr_is_matched_by_revision() {
    let policy = r#"
rules:
  - path_pattern: "modules/**"
    workflows: [plan.yml]
"#;
    let h = Harness::new(policy, ScriptedPlatform::touching(&["modules/vpc.tf"]));

    h.send(opened()).await;
    h.settle().await;
    assert_eq!(h.platform.workflow_calls(), 1);

    h.send(NormalizedEvent::WorkflowCompleted {
        repo_owner: "acme".to_string(),
        repo_name: "infra".to_string(),
        pr_number: None,
        installation_id: 42,
        workflow: "plan.yml".to_string(),
        revision: CommitSha::from(REVISION),
        run_id: 9001,
        run_attempt: 1,
        succeeded: true,
    })
    .await;

    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.run("plan.yml").unwrap().status, RunStatus::Succeeded);
    assert_eq!(pr.lifecycle, PrLifecycle::Ready);
}

const REVIEW_AND_PLAN_POLICY: &str = r#"
rules:
  - path_pattern: "modules/**"
    reviewers: [alice]
    required_approvals: 1
    workflows: [plan.yml]
"#;

#[tokio::test(start_paused = true)]
async fn test_reopen_with_same_revision_dispatches_again() {
    let h = Harness::new(
        REVIEW_AND_PLAN_POLICY,
        ScriptedPlatform::touching(&["modules/vpc.tf"]),
    );

    h.send(opened()).await;
    h.settle().await;
    assert_eq!(h.platform.reviewer_calls("alice"), vec![true]);
    assert_eq!(h.platform.workflow_calls(), 1);

    h.send(closed(false)).await;
    h.settle().await;
    assert!(h.service.store().get(&key()).await.unwrap().is_none());

    h.send(opened()).await;
    h.settle().await;
    assert_eq!(h.platform.reviewer_calls("alice"), vec![true, true]);
    assert_eq!(h.platform.workflow_calls(), 2);

    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.requested_reviewers, logins(&["alice"]));

    h.send(plan_completed(Some(7), 9002)).await;
    h.send(approval("alice", 200)).await;
    h.settle().await;

    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.run("plan.yml").unwrap().status, RunStatus::Succeeded);
    assert_eq!(pr.lifecycle, PrLifecycle::Ready);
    assert_eq!(h.platform.last_status(), Some(GateStatusState::Success));
}

#[tokio::test(start_paused = true)]
async fn test_push_back_to_earlier_revision_triggers_workflow_again() {
    let policy = r#"
rules:
  - path_pattern: "modules/**"
    workflows: [plan.yml]
"#;
    let h = Harness::new(policy, ScriptedPlatform::touching(&["modules/vpc.tf"]));

    h.send(opened()).await;
    h.settle().await;
    h.send(opened_at("fedcba9876")).await;
    h.settle().await;
    assert_eq!(h.platform.workflow_calls(), 2);

    h.send(opened_at(REVISION)).await;
    h.settle().await;
    assert_eq!(h.platform.workflow_calls(), 3);

    let pr = h.service.store().get(&key()).await.unwrap().unwrap();
    assert_eq!(pr.revision, CommitSha::from(REVISION));
    assert_eq!(pr.run("plan.yml").unwrap().attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_events_after_merge_do_not_register_the_pr_again() {
    let h = Harness::new(
        REVIEW_AND_PLAN_POLICY,
        ScriptedPlatform::touching(&["modules/vpc.tf"]),
    );

    h.send(opened()).await;
    h.settle().await;
    h.send(closed(true)).await;
    h.settle().await;
    h.platform.set_state(PullRequestState::Merged);
    let calls_at_merge = h.platform.calls().len();

    h.send(plan_completed(Some(7), 9003)).await;
    h.send(approval("alice", 300)).await;
    h.settle().await;

    // Only the lookups that found the PR merged.
    let after: Vec<Call> = h.platform.calls()[calls_at_merge..].to_vec();
    assert_eq!(after, vec![Call::GetPullRequest, Call::GetPullRequest]);
    assert!(h.service.store().get(&key()).await.unwrap().is_none());
    assert!(h.service.store().get_all().await.unwrap().is_empty());
}
