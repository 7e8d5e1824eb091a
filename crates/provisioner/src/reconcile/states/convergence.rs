use tracing::{info, warn};

use super::addresses::ResolvingAddresses;
use crate::error::ReconcileError;
use crate::poll::{PollError, PollOutcome, PollResult, RetryPolicy};
use crate::reconcile::state::{State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};
use crate::stack::{StackEvent, StackStatus};

const RECENT_EVENTS: usize = 10;

/// Waits for the new stack to reach CREATE_COMPLETE.
#[derive(Debug, Default)]
pub(crate) struct AwaitingConvergence;

impl TransitionTo<ResolvingAddresses> for AwaitingConvergence {}

#[async_trait::async_trait]
impl State for AwaitingConvergence {
    fn phase(&self) -> Phase {
        Phase::AwaitingConvergence
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        let cloud = ctx.cloud;
        let name = config.stack_name.as_str();
        let what = format!("stack {}", name);
        let policy = RetryPolicy::covering(config.stack_timeout, config.stack_poll_interval);

        let result = ctx
            .poller
            .poll_until(&what, &policy, move || async move {
                match cloud.describe(name).await {
                    // A failed stack is terminal too; it is told apart below.
                    Ok(Some(stack))
                        if stack.status == StackStatus::CreateComplete
                            || stack.status.is_failed() =>
                    {
                        PollOutcome::Done(stack)
                    }
                    Ok(Some(stack)) => PollOutcome::Pending(stack.status.to_string()),
                    Ok(None) => PollOutcome::Pending("stack not visible yet".to_owned()),
                    Err(e) => PollOutcome::Pending(format!("stack show failed: {}", e)),
                }
            })
            .await;

        match result {
            Ok(PollResult::Done(stack)) if stack.status.is_failed() => {
                let cause = match &stack.status_reason {
                    Some(reason) => format!("{}: {}", stack.status, reason),
                    None => stack.status.to_string(),
                };
                ctx.stack_status = Some(stack.status);
                Transition::Complete(Err(failed(ctx, what, cause).await))
            }
            Ok(PollResult::Done(stack)) => {
                info!(stack = %name, outputs = stack.outputs.len(), "Stack converged");
                ctx.stack_status = Some(stack.status);
                ctx.outputs = stack.outputs;
                Transition::next(self, ResolvingAddresses)
            }
            Ok(PollResult::Exhausted(last_observed)) => {
                let attempts = policy.max_attempts().unwrap_or_default();
                Transition::Complete(Err(timed_out(ctx, what, attempts, last_observed).await))
            }
            Err(PollError::Timeout {
                what,
                attempts,
                last_observed,
            }) => Transition::Complete(Err(timed_out(ctx, what, attempts, last_observed).await)),
            Err(e) => Transition::Complete(Err(e.into())),
        }
    }
}

async fn failed(ctx: &RunContext<'_>, what: String, cause: String) -> ReconcileError {
    let name = &ctx.config.stack_name;
    let failed_resources = match ctx.cloud.list_failed_resources(name).await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(stack = %name, error = %e, "Unable to list failed resources");
            Vec::new()
        }
    };
    ReconcileError::PollFailed {
        what,
        cause,
        failed_resources,
    }
}

async fn timed_out(
    ctx: &mut RunContext<'_>,
    what: String,
    attempts: u32,
    last_observed: Option<String>,
) -> ReconcileError {
    let config = ctx.config;
    let name = &config.stack_name;
    ctx.stack_status = last_observed.as_deref().map(StackStatus::from);
    let events = match ctx.cloud.list_events(name).await {
        Ok(events) => recent(events),
        Err(e) => {
            warn!(stack = %name, error = %e, "Unable to list stack events");
            Vec::new()
        }
    };
    ReconcileError::PollTimeout {
        what,
        attempts,
        last_observed,
        events,
    }
}

fn recent(mut events: Vec<StackEvent>) -> Vec<StackEvent> {
    let skip = events.len().saturating_sub(RECENT_EVENTS);
    events.drain(..skip);
    events
}
