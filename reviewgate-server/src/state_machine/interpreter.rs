//! Effect interpreter.
//!
//! The boundary between the pure transition function and I/O. Dispatch
//! effects are handed to the [`Dispatcher`] and return immediately; gate
//! status publication is awaited so statuses for one PR land in order.

use std::sync::Arc;

use reviewgate_core::PrKey;
use tracing::{debug, error, info, warn};

use super::effect::{Effect, LogLevel};
use crate::dispatcher::{DispatchRequest, DispatchTarget, Dispatcher};
use crate::platform::{CallContext, CommitStatus, Platform};
use crate::GATE_STATUS_CONTEXT;

/// Context needed by the interpreter to execute effects for one PR.
pub struct InterpreterContext {
    pub key: PrKey,
    pub call: CallContext,
    pub platform: Arc<dyn Platform>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Execute effects in order. Failures are logged and do not stop the
/// remaining effects.
pub async fn execute_effects(ctx: &InterpreterContext, effects: Vec<Effect>) {
    for effect in effects {
        execute_effect(ctx, effect).await;
    }
}

async fn execute_effect(ctx: &InterpreterContext, effect: Effect) {
    match effect {
        Effect::RequestReviewers {
            revision,
            reviewers,
        } => {
            for reviewer in reviewers {
                ctx.dispatcher.dispatch(DispatchRequest {
                    key: ctx.key.clone(),
                    revision: revision.clone(),
                    target: DispatchTarget::Reviewer(reviewer),
                    ctx: ctx.call.clone(),
                });
            }
        }

        Effect::TriggerWorkflow {
            workflow,
            revision,
            git_ref,
        } => {
            ctx.dispatcher.dispatch(DispatchRequest {
                key: ctx.key.clone(),
                revision,
                target: DispatchTarget::Workflow { workflow, git_ref },
                ctx: ctx.call.clone(),
            });
        }

        Effect::PublishGateStatus {
            revision,
            state,
            description,
        } => {
            let status = CommitStatus {
                state,
                description,
                context: GATE_STATUS_CONTEXT.to_string(),
            };
            match ctx
                .platform
                .create_commit_status(&ctx.call, &ctx.key, &revision, &status)
                .await
            {
                Ok(()) => debug!(
                    "{}@{}: published gate status {:?}",
                    ctx.key,
                    revision.short(),
                    status.state
                ),
                // Best effort: the next change republishes.
                Err(e) => warn!(
                    "{}@{}: failed to publish gate status: {}",
                    ctx.key,
                    revision.short(),
                    e
                ),
            }
        }

        Effect::CancelDispatches => ctx.dispatcher.cancel(&ctx.key),

        Effect::Log { level, message } => match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        },
    }
}
