//! The state machine driving a reconciliation run.

use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use super::{Phase, ReconcileReport, RunContext};
use crate::error::ReconcileError;
use crate::poll::{PollError, PollResult, RetryPolicy};

/// Guard for preventing manual construction on Transition::Next.
pub(crate) struct StateHolder {
    state: Box<dyn State>,
}

impl From<StateHolder> for Box<dyn State> {
    fn from(holder: StateHolder) -> Box<dyn State> {
        holder.state
    }
}

/// Represents result of state execution and which state to transition to next.
pub(crate) enum Transition {
    /// Transition to new state.
    Next(StateHolder),
    /// Stop executing the state machine and report the result of the run.
    Complete(Result<ReconcileReport, ReconcileError>),
}

/// Mark an edge exists between two states.
pub(crate) trait TransitionTo<S> {}

impl Transition {
    /// Construct Transition::Next from old state and new state. The input
    /// state must implement `TransitionTo<OutputState>`, so an edge missing
    /// from the graph is a compile error.
    #[allow(clippy::boxed_local)]
    pub(crate) fn next<I: State, O: State>(_i: Box<I>, o: O) -> Transition
    where
        I: TransitionTo<O>,
    {
        Transition::Next(StateHolder { state: Box::new(o) })
    }
}

/// A node in the reconciliation graph.
#[async_trait::async_trait]
pub(crate) trait State: Sync + Send + 'static + std::fmt::Debug {
    /// The phase reported while this state runs.
    fn phase(&self) -> Phase;

    /// Do the work of this state and pick the next one.
    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition;
}

/// Iteratively evaluate the state machine until it returns Complete.
///
/// Cancellation and the optional deadline are checked before every state; a
/// state already running is never interrupted here.
pub(crate) async fn run_to_completion(
    state: impl State,
    ctx: &mut RunContext<'_>,
    deadline: Option<Instant>,
) -> Result<ReconcileReport, (Phase, ReconcileError)> {
    let mut state: Box<dyn State> = Box::new(state);

    loop {
        let phase = state.phase();
        if ctx.cancel.is_cancelled() {
            info!(%phase, "Run cancelled before entering phase");
            return Err((phase, ReconcileError::Cancelled));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let limit = ctx.config.deadline.unwrap_or_default();
                return Err((phase, ReconcileError::DeadlineExceeded(limit)));
            }
        }

        info!(stack = %ctx.config.stack_name, %phase, "Entering phase");
        trace!(?state, "Executing state handler");
        let transition = state.next(ctx).await;

        state = match transition {
            Transition::Next(s) => {
                let state: Box<dyn State> = s.into();
                debug!(from = %phase, to = %state.phase(), "Transitioning");
                state
            }
            Transition::Complete(Ok(report)) => {
                debug!(stack = %ctx.config.stack_name, "State machine exited without error");
                return Ok(report);
            }
            Transition::Complete(Err(e)) => {
                error!(stack = %ctx.config.stack_name, %phase, error = %e, "State machine exited with error");
                return Err((phase, e));
            }
        };
    }
}

/// Unwrap a poll that has to reach its condition, treating an exhausted
/// policy like a timeout.
pub(crate) fn require_done<T>(
    what: &str,
    policy: &RetryPolicy,
    result: Result<PollResult<T>, PollError>,
) -> Result<T, ReconcileError> {
    match result? {
        PollResult::Done(value) => Ok(value),
        PollResult::Exhausted(last_observed) => Err(ReconcileError::PollTimeout {
            what: what.to_owned(),
            attempts: policy.max_attempts().unwrap_or_default(),
            last_observed,
            events: Vec::new(),
        }),
    }
}
