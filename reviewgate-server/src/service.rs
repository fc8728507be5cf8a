//! Glue between ingress, policy, platform and tracker.

use std::sync::Arc;

use reviewgate_core::policy::{self, PolicyHandle, Resolution, ResolutionRequest};
use reviewgate_core::{PrKey, PullRequestSnapshot, PullRequestState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::Feedback;
use crate::error::GateError;
use crate::ingress::NormalizedEvent;
use crate::platform::{CallContext, Platform};
use crate::state_machine::{Event, StateStore};

pub struct GateService {
    store: Arc<StateStore>,
    platform: Arc<dyn Platform>,
    policy: PolicyHandle,
}

impl GateService {
    pub fn new(store: Arc<StateStore>, platform: Arc<dyn Platform>, policy: PolicyHandle) -> Self {
        Self {
            store,
            platform,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    /// Resolve `snapshot` against the rules active right now.
    pub fn resolve(&self, snapshot: &PullRequestSnapshot) -> Resolution {
        let rules = self.policy.current();
        let repository = snapshot.key.full_repo();
        policy::resolve(
            &rules,
            &ResolutionRequest {
                repository: &repository,
                target_branch: &snapshot.target_branch,
                changed_files: &snapshot.changed_files,
                author: Some(&snapshot.author),
            },
        )
    }

    /// Apply one normalized webhook event.
    pub async fn handle(
        &self,
        event: NormalizedEvent,
        correlation_id: Option<String>,
    ) -> Result<(), GateError> {
        let call = CallContext::new(event.installation_id(), correlation_id);

        match event {
            NormalizedEvent::PrOpened {
                key,
                revision,
                source_branch,
                target_branch,
                author,
                ..
            } => {
                let changed_files = self
                    .platform
                    .list_changed_files(&call, &key)
                    .await
                    .map_err(|source| GateError::Registration {
                        key: key.clone(),
                        source,
                    })?;
                let snapshot = PullRequestSnapshot {
                    key: key.clone(),
                    revision,
                    source_branch,
                    target_branch,
                    author,
                    changed_files,
                    state: PullRequestState::Open,
                };
                self.open(snapshot, call).await
            }

            NormalizedEvent::ReviewSubmitted { key, review, .. } => {
                self.apply_or_register(&key, Event::ReviewSubmitted { review }, call)
                    .await
            }

            NormalizedEvent::WorkflowCompleted {
                repo_owner,
                repo_name,
                pr_number,
                workflow,
                revision,
                run_id,
                run_attempt,
                succeeded,
                ..
            } => {
                let keys = match pr_number {
                    Some(number) => vec![PrKey::new(&repo_owner, &repo_name, number)],
                    None => {
                        self.store
                            .find_by_revision(&repo_owner, &repo_name, &revision)
                            .await?
                    }
                };
                if keys.is_empty() {
                    debug!(
                        "{}/{}: no tracked PR at {} for {} run {}",
                        repo_owner,
                        repo_name,
                        revision.short(),
                        workflow,
                        run_id
                    );
                }
                for key in keys {
                    let event = Event::WorkflowCompleted {
                        workflow: workflow.clone(),
                        revision: revision.clone(),
                        run_id,
                        run_attempt,
                        succeeded,
                    };
                    self.apply_or_register(&key, event, call.clone()).await?;
                }
                Ok(())
            }

            NormalizedEvent::PrClosed { key, merged, .. } => {
                self.store
                    .process_event(&key, Event::PrClosed { merged }, call)
                    .await?;
                Ok(())
            }
        }
    }

    async fn open(&self, snapshot: PullRequestSnapshot, call: CallContext) -> Result<(), GateError> {
        let key = snapshot.key.clone();
        let resolution = self.resolve(&snapshot);
        let event = Event::PrOpened {
            snapshot,
            installation_id: call.installation_id,
            resolution,
        };
        self.store.process_event(&key, event, call).await?;
        Ok(())
    }

    /// Apply `event`; if the PR was never registered, fetch it from the
    /// platform, register it and apply the event once more. Events for PRs
    /// the platform reports as closed or merged are dropped.
    async fn apply_or_register(
        &self,
        key: &PrKey,
        event: Event,
        call: CallContext,
    ) -> Result<(), GateError> {
        match self
            .store
            .process_event(key, event.clone(), call.clone())
            .await
        {
            Ok(_) => Ok(()),
            Err(GateError::UnknownPullRequest { .. }) => {
                info!("{}: not tracked yet, registering from platform", key);
                let snapshot = self
                    .platform
                    .get_pull_request(&call, key)
                    .await
                    .map_err(|source| GateError::Registration {
                        key: key.clone(),
                        source,
                    })?;
                if !snapshot.state.is_open() {
                    info!(
                        "{}: already {}, dropping {}",
                        key,
                        snapshot.state,
                        event.log_summary()
                    );
                    return Ok(());
                }
                self.open(snapshot, call.clone()).await?;
                self.store.process_event(key, event, call).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply dispatcher feedback until the channel closes.
    pub async fn run_feedback_loop(self: Arc<Self>, mut feedback: mpsc::UnboundedReceiver<Feedback>) {
        while let Some(Feedback {
            key,
            installation_id,
            event,
        }) = feedback.recv().await
        {
            let summary = event.log_summary();
            if let Err(e) = self
                .store
                .process_event(&key, event, CallContext::new(installation_id, None))
                .await
            {
                warn!("{}: failed to apply {}: {}", key, summary, e);
            }
        }
        debug!("Dispatch feedback channel closed");
    }
}
