//! Background dispatch of reviewer requests and workflow triggers.
//!
//! Each target runs in its own task with exponential backoff on transient
//! failures. Every PR has a cancellation token; closing the PR or pushing a
//! new revision cancels the token and stops its tasks between attempts or
//! mid-call. Outcomes come back to the tracker as [`Feedback`] events, so
//! state only ever changes under the PR's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reviewgate_core::{CommitSha, Login, PrKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::platform::{CallContext, Platform, PlatformError};
use crate::state_machine::repository::StateRepository;
use crate::state_machine::Event;

/// Retry policy for dispatch calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Total attempts per target, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Delay before the attempt after `attempt` (1-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    Reviewer(Login),
    Workflow { workflow: String, git_ref: String },
}

impl DispatchTarget {
    pub fn label(&self) -> String {
        match self {
            Self::Reviewer(login) => format!("reviewer:{}", login),
            Self::Workflow { workflow, .. } => format!("workflow:{}", workflow),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub key: PrKey,
    pub revision: CommitSha,
    pub target: DispatchTarget,
    pub ctx: CallContext,
}

impl DispatchRequest {
    /// Stable per (PR, target, revision); the same key is sent to the
    /// platform and recorded in the ledger.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.key, self.target.label(), self.revision)
    }
}

/// An event produced by a dispatch task, to be applied to `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feedback {
    pub key: PrKey,
    pub installation_id: u64,
    pub event: Event,
}

enum Outcome {
    Done { attempts: u32 },
    Rejected { attempts: u32, message: String },
    Exhausted { attempts: u32, message: String },
    Cancelled,
}

pub struct Dispatcher {
    platform: Arc<dyn Platform>,
    ledger: Arc<dyn StateRepository>,
    config: DispatchConfig,
    feedback: mpsc::UnboundedSender<Feedback>,
    tokens: Mutex<HashMap<PrKey, CancellationToken>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        platform: Arc<dyn Platform>,
        ledger: Arc<dyn StateRepository>,
        config: DispatchConfig,
        feedback: mpsc::UnboundedSender<Feedback>,
    ) -> Self {
        Self {
            platform,
            ledger,
            config,
            feedback,
            tokens: Mutex::new(HashMap::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    fn token_for(&self, key: &PrKey) -> CancellationToken {
        let mut tokens = match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tokens.entry(key.clone()).or_default().clone()
    }

    /// Start dispatching `request` in the background.
    pub fn dispatch(self: &Arc<Self>, request: DispatchRequest) {
        let token = self.token_for(&request.key);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(request, token).await });

        let mut handles = match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Cancel every in-flight dispatch for `key`. Later dispatches for the
    /// same PR get a fresh token.
    pub fn cancel(&self, key: &PrKey) {
        let token = match self.tokens.lock() {
            Ok(mut guard) => guard.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        };
        if let Some(token) = token {
            debug!("{}: cancelling in-flight dispatches", key);
            token.cancel();
        }
    }

    /// Wait for every task spawned so far to finish.
    pub async fn drain(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = match self.handles.lock() {
                Ok(mut guard) => guard.drain(..).collect(),
                Err(poisoned) => poisoned.into_inner().drain(..).collect(),
            };
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                let _ = handle.await;
            }
        }
    }

    async fn run(&self, request: DispatchRequest, token: CancellationToken) {
        let idempotency_key = request.idempotency_key();

        match self.ledger.try_claim_dispatch(&idempotency_key).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{}: already dispatched, skipping", idempotency_key);
                return;
            }
            Err(e) => {
                // Without the ledger a duplicate call is possible but harmless:
                // the platform sees the same idempotency key.
                warn!("{}: dispatch ledger unavailable: {}", idempotency_key, e);
            }
        }

        let outcome = self.attempt_until_done(&request, &idempotency_key, &token).await;

        let ledger_result = match &outcome {
            Outcome::Done { .. } | Outcome::Rejected { .. } => {
                self.ledger.complete_dispatch(&idempotency_key).await
            }
            Outcome::Exhausted { .. } | Outcome::Cancelled => {
                self.ledger.release_dispatch(&idempotency_key).await
            }
        };
        if let Err(e) = ledger_result {
            warn!("{}: failed to update dispatch ledger: {}", idempotency_key, e);
        }

        if let Some(event) = feedback_event(&request, outcome) {
            self.send(&request, event);
        }
    }

    async fn attempt_until_done(
        &self,
        request: &DispatchRequest,
        idempotency_key: &str,
        token: &CancellationToken,
    ) -> Outcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let result = tokio::select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                result = self.call(request, idempotency_key) => result,
            };

            let err = match result {
                Ok(()) => {
                    info!("{}: dispatched on attempt {}", idempotency_key, attempt);
                    return Outcome::Done { attempts: attempt };
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                return Outcome::Rejected {
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            if attempt >= self.config.max_attempts {
                return Outcome::Exhausted {
                    attempts: attempt,
                    message: err.to_string(),
                };
            }

            let delay = self.config.backoff(attempt);
            warn!(
                "{}: attempt {} failed, retrying in {:?}: {}",
                idempotency_key, attempt, delay, err
            );
            if let DispatchTarget::Workflow { workflow, .. } = &request.target {
                self.send(
                    request,
                    Event::WorkflowDispatchRetrying {
                        workflow: workflow.clone(),
                        revision: request.revision.clone(),
                        attempts: attempt,
                        message: err.to_string(),
                    },
                );
            }

            tokio::select! {
                _ = token.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn call(
        &self,
        request: &DispatchRequest,
        idempotency_key: &str,
    ) -> Result<(), PlatformError> {
        match &request.target {
            DispatchTarget::Reviewer(login) => {
                self.platform
                    .request_reviewers(
                        &request.ctx,
                        &request.key,
                        std::slice::from_ref(login),
                        idempotency_key,
                    )
                    .await
            }
            DispatchTarget::Workflow { workflow, git_ref } => {
                self.platform
                    .trigger_workflow(
                        &request.ctx,
                        &request.key,
                        workflow,
                        git_ref,
                        &request.revision,
                        idempotency_key,
                    )
                    .await
            }
        }
    }

    fn send(&self, request: &DispatchRequest, event: Event) {
        let feedback = Feedback {
            key: request.key.clone(),
            installation_id: request.ctx.installation_id,
            event,
        };
        if self.feedback.send(feedback).is_err() {
            debug!("{}: feedback channel closed", request.key);
        }
    }
}

fn feedback_event(request: &DispatchRequest, outcome: Outcome) -> Option<Event> {
    let revision = request.revision.clone();
    match (&request.target, outcome) {
        (_, Outcome::Cancelled) => {
            debug!("{}: dispatch of {} cancelled", request.key, request.target.label());
            None
        }
        (DispatchTarget::Reviewer(login), Outcome::Done { .. }) => Some(Event::ReviewerRequested {
            revision,
            reviewer: login.clone(),
        }),
        (DispatchTarget::Reviewer(login), Outcome::Rejected { message, .. }) => {
            Some(Event::ReviewerRejected {
                revision,
                reviewer: login.clone(),
                message,
            })
        }
        (DispatchTarget::Reviewer(login), Outcome::Exhausted { attempts, message }) => {
            error!(
                "{}: giving up requesting {} after {} attempts: {}",
                request.key, login, attempts, message
            );
            None
        }
        (DispatchTarget::Workflow { workflow, .. }, Outcome::Done { attempts }) => {
            Some(Event::WorkflowDispatched {
                workflow: workflow.clone(),
                revision,
                attempts,
            })
        }
        (DispatchTarget::Workflow { workflow, .. }, Outcome::Rejected { attempts, message }) => {
            Some(Event::WorkflowDispatchFailed {
                workflow: workflow.clone(),
                revision,
                attempts,
                message,
                rejected: true,
            })
        }
        (DispatchTarget::Workflow { workflow, .. }, Outcome::Exhausted { attempts, message }) => {
            Some(Event::WorkflowDispatchFailed {
                workflow: workflow.clone(),
                revision,
                attempts,
                message,
                rejected: false,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::CommitStatus;
    use crate::state_machine::repository::InMemoryRepository;
    use async_trait::async_trait;
    use reviewgate_core::PullRequestSnapshot;
    use std::collections::{BTreeSet, VecDeque};

    /// Platform whose trigger results are scripted per call.
    #[derive(Default)]
    struct Scripted {
        results: Mutex<VecDeque<Result<(), PlatformError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(results: Vec<Result<(), PlatformError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn next(&self, call: String) -> Result<(), PlatformError> {
            self.calls.lock().unwrap().push(call);
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Platform for Scripted {
        async fn request_reviewers(
            &self,
            _ctx: &CallContext,
            _key: &PrKey,
            reviewers: &[Login],
            _idempotency_key: &str,
        ) -> Result<(), PlatformError> {
            self.next(format!("reviewers:{:?}", reviewers))
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
            self.next(format!("trigger:{}", workflow))
        }

        async fn get_pull_request(
            &self,
            _ctx: &CallContext,
            _key: &PrKey,
        ) -> Result<PullRequestSnapshot, PlatformError> {
            Err(PlatformError::Unexpected("not scripted".to_string()))
        }

        async fn list_changed_files(
            &self,
            _ctx: &CallContext,
            _key: &PrKey,
        ) -> Result<BTreeSet<String>, PlatformError> {
            Ok(BTreeSet::new())
        }

        async fn create_commit_status(
            &self,
            _ctx: &CallContext,
            _key: &PrKey,
            _sha: &CommitSha,
            _status: &CommitStatus,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    fn dispatcher(
        platform: Arc<Scripted>,
    ) -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<Feedback>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(
            platform,
            Arc::new(InMemoryRepository::new()),
            DispatchConfig::default(),
            tx,
        );
        (Arc::new(dispatcher), rx)
    }

    fn workflow_request() -> DispatchRequest {
        DispatchRequest {
            key: PrKey::new("acme", "infra", 7),
            revision: CommitSha::from("abc123"),
            target: DispatchTarget::Workflow {
                workflow: "plan.yml".to_string(),
                git_ref: "feature/vpc".to_string(),
            },
            ctx: CallContext::new(42, None),
        }
    }

    fn unavailable() -> Result<(), PlatformError> {
        Err(PlatformError::from_status(503, "unavailable"))
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<Feedback>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(feedback) = rx.try_recv() {
            events.push(feedback.event);
        }
        events
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = DispatchConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(2), Duration::from_millis(1000));
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
        assert_eq!(config.backoff(8), Duration::from_secs(30));
        assert_eq!(config.backoff(100), Duration::from_secs(30));
    }

    #[test]
    fn test_idempotency_key_is_per_target_and_revision() {
        let request = workflow_request();
        assert_eq!(
            request.idempotency_key(),
            "acme/infra#7:workflow:plan.yml:abc123"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failure_then_succeeds() {
        let platform = Scripted::with(vec![unavailable()]);
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        dispatcher.dispatch(workflow_request());
        dispatcher.drain().await;

        assert_eq!(platform.call_count(), 2);
        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[..],
            [
                Event::WorkflowDispatchRetrying { attempts: 1, .. },
                Event::WorkflowDispatched { attempts: 2, .. },
            ]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let platform = Scripted::with((0..10).map(|_| unavailable()).collect());
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        dispatcher.dispatch(workflow_request());
        dispatcher.drain().await;

        assert_eq!(platform.call_count(), 5);
        let events = drain_events(&mut rx);
        assert!(matches!(
            events.last(),
            Some(Event::WorkflowDispatchFailed {
                attempts: 5,
                rejected: false,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let platform = Scripted::with(vec![Err(PlatformError::from_status(422, "no such ref"))]);
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        dispatcher.dispatch(workflow_request());
        dispatcher.drain().await;

        assert_eq!(platform.call_count(), 1);
        assert!(matches!(
            &drain_events(&mut rx)[..],
            [Event::WorkflowDispatchFailed { rejected: true, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_reviewer_is_reported() {
        let platform = Scripted::with(vec![Err(PlatformError::from_status(
            422,
            "not a collaborator",
        ))]);
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        let mut request = workflow_request();
        request.target = DispatchTarget::Reviewer(Login::new("ghost"));
        dispatcher.dispatch(request);
        dispatcher.drain().await;

        match &drain_events(&mut rx)[..] {
            [Event::ReviewerRejected { reviewer, message, .. }] => {
                assert_eq!(reviewer.as_str(), "ghost");
                assert!(message.contains("not a collaborator"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_retry() {
        let platform = Scripted::with((0..10).map(|_| unavailable()).collect());
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        dispatcher.dispatch(workflow_request());
        // Let the first attempt fail and the task start its backoff sleep.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(platform.call_count(), 1);

        dispatcher.cancel(&PrKey::new("acme", "infra", 7));
        dispatcher.drain().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(platform.call_count(), 1);
        let events = drain_events(&mut rx);
        assert!(matches!(
            &events[..],
            [Event::WorkflowDispatchRetrying { attempts: 1, .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_dispatch_is_not_repeated() {
        let platform = Scripted::with(vec![]);
        let (dispatcher, mut rx) = dispatcher(platform.clone());

        dispatcher.dispatch(workflow_request());
        dispatcher.drain().await;
        dispatcher.dispatch(workflow_request());
        dispatcher.drain().await;

        assert_eq!(platform.call_count(), 1);
        assert_eq!(drain_events(&mut rx).len(), 1);
    }
}
