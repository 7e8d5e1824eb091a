use tracing::info;

use super::cleanup::CleanupExisting;
use super::provisioning::Provisioning;
use crate::reconcile::state::{State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};

/// Looks for a stack left over from a previous run.
#[derive(Debug, Default)]
pub(crate) struct Start;

impl TransitionTo<CleanupExisting> for Start {}
impl TransitionTo<Provisioning> for Start {}

#[async_trait::async_trait]
impl State for Start {
    fn phase(&self) -> Phase {
        Phase::Start
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        let name = &config.stack_name;
        match ctx.cloud.describe(name).await {
            Ok(Some(stack)) => {
                info!(stack = %name, status = %stack.status, "Found existing stack");
                ctx.stack_status = Some(stack.status.clone());
                Transition::next(self, CleanupExisting::new(stack.status))
            }
            Ok(None) => {
                info!(stack = %name, "No existing stack, provisioning from scratch");
                Transition::next(self, Provisioning)
            }
            Err(e) => Transition::Complete(Err(ctx.provision_error("stack show", e))),
        }
    }
}
