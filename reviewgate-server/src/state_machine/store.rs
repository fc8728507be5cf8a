//! Assignment tracker: per-PR state behind a FIFO lock.
//!
//! `process_event` is the single entry point for mutations. It loads the PR
//! from the repository, runs the pure transition, persists the result (or
//! evicts a closed PR) and then executes the effects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use reviewgate_core::{ApprovalRecord, CommitSha, GateDecision, PrKey};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::event::Event;
use super::interpreter::{execute_effects, InterpreterContext};
use super::repository::StateRepository;
use super::state::TrackedPullRequest;
use super::transition::{transition, TransitionResult};
use crate::dispatcher::Dispatcher;
use crate::error::GateError;
use crate::platform::{CallContext, Platform};

pub struct StateStore {
    repository: Arc<dyn StateRepository>,
    platform: Arc<dyn Platform>,
    dispatcher: Arc<Dispatcher>,
    /// tokio's mutex queues waiters in FIFO order, which gives per-PR
    /// arrival-order processing.
    locks: Mutex<HashMap<PrKey, Arc<AsyncMutex<()>>>>,
}

impl StateStore {
    pub fn new(
        repository: Arc<dyn StateRepository>,
        platform: Arc<dyn Platform>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            repository,
            platform,
            dispatcher,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn StateRepository> {
        &self.repository
    }

    fn lock_for(&self, key: &PrKey) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the lock entry for a finished PR unless someone is waiting on it.
    fn release_lock(&self, key: &PrKey, lock: &Arc<AsyncMutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    /// Apply `event` to the PR and execute the resulting effects.
    ///
    /// Returns the PR's state afterwards; `None` if it is untracked or was
    /// just closed.
    pub async fn process_event(
        &self,
        key: &PrKey,
        event: Event,
        call: CallContext,
    ) -> Result<Option<TrackedPullRequest>, GateError> {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;

        let current = self.repository.get(key).await?;
        // Calls for a tracked PR authenticate as the installation it was
        // registered under.
        let installation_id = current
            .as_ref()
            .map(|pr| pr.installation_id)
            .unwrap_or(call.installation_id);
        let previous_revision = current.as_ref().map(|pr| pr.revision.clone());
        debug!("{}: processing {}", key, event.log_summary());

        let TransitionResult { state, effects } = transition(key, current, event)?;

        let retained = match state {
            Some(pr) if pr.lifecycle.is_terminal() => {
                self.repository.delete(key).await?;
                info!("{}: evicted ({})", key, pr.lifecycle);
                None
            }
            Some(pr) => {
                self.repository.put(&pr).await?;
                Some(pr)
            }
            None => None,
        };

        // A reopened PR or a head moved back to an earlier commit must be
        // dispatched again, so ledger entries never outlive the revision
        // they were recorded for.
        let superseded = match (&previous_revision, &retained) {
            (Some(_), None) => true,
            (Some(before), Some(pr)) => *before != pr.revision,
            (None, _) => false,
        };
        if superseded {
            match self.repository.clear_dispatches(key).await {
                Ok(removed) => debug!("{}: cleared {} ledger entr(ies)", key, removed),
                Err(e) => warn!("{}: failed to clear dispatch ledger: {}", key, e),
            }
        }

        let ctx = InterpreterContext {
            key: key.clone(),
            call: CallContext::new(installation_id, call.correlation_id),
            platform: self.platform.clone(),
            dispatcher: self.dispatcher.clone(),
        };
        execute_effects(&ctx, effects).await;

        drop(guard);
        if retained.is_none() {
            self.release_lock(key, &lock);
        }
        Ok(retained)
    }

    pub async fn record_approval(
        &self,
        key: &PrKey,
        review: ApprovalRecord,
        call: CallContext,
    ) -> Result<Option<TrackedPullRequest>, GateError> {
        self.process_event(key, Event::ReviewSubmitted { review }, call)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn record_workflow_status(
        &self,
        key: &PrKey,
        workflow: String,
        revision: CommitSha,
        run_id: u64,
        run_attempt: u32,
        succeeded: bool,
        call: CallContext,
    ) -> Result<Option<TrackedPullRequest>, GateError> {
        let event = Event::WorkflowCompleted {
            workflow,
            revision,
            run_id,
            run_attempt,
            succeeded,
        };
        self.process_event(key, event, call).await
    }

    /// Gate decision for a tracked PR. Never mutates state.
    pub async fn current_gate_state(&self, key: &PrKey) -> Result<GateDecision, GateError> {
        match self.repository.get(key).await? {
            Some(pr) => Ok(pr.gate()),
            None => Err(GateError::UnknownPullRequest { key: key.clone() }),
        }
    }

    pub async fn get(&self, key: &PrKey) -> Result<Option<TrackedPullRequest>, GateError> {
        Ok(self.repository.get(key).await?)
    }

    pub async fn get_all(&self) -> Result<Vec<TrackedPullRequest>, GateError> {
        Ok(self.repository.get_all().await?)
    }

    /// Tracked PRs in `owner/name` whose head is `revision`.
    pub async fn find_by_revision(
        &self,
        repo_owner: &str,
        repo_name: &str,
        revision: &CommitSha,
    ) -> Result<Vec<PrKey>, GateError> {
        Ok(self
            .repository
            .get_all()
            .await?
            .into_iter()
            .filter(|pr| {
                pr.key.repo_owner == repo_owner
                    && pr.key.repo_name == repo_name
                    && &pr.revision == revision
            })
            .map(|pr| pr.key)
            .collect())
    }
}
