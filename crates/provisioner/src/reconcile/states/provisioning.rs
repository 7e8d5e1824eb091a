use tracing::info;

use super::convergence::AwaitingConvergence;
use crate::reconcile::state::{State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};

/// Asks the provider to create the stack. Does not wait for it.
#[derive(Debug, Default)]
pub(crate) struct Provisioning;

impl TransitionTo<AwaitingConvergence> for Provisioning {}

#[async_trait::async_trait]
impl State for Provisioning {
    fn phase(&self) -> Phase {
        Phase::Provisioning
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        info!(
            stack = %config.stack_name,
            template = %config.template.display(),
            parameters = config.parameters.len(),
            "Creating stack"
        );
        match ctx
            .cloud
            .create(&config.stack_name, &config.template, &config.parameters)
            .await
        {
            Ok(id) => {
                info!(stack = %config.stack_name, %id, "Stack creation accepted");
                Transition::next(self, AwaitingConvergence)
            }
            Err(e) => Transition::Complete(Err(ctx.provision_error("stack create", e))),
        }
    }
}
