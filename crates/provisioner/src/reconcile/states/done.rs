use crate::inventory::HostInventory;
use crate::reconcile::state::{State, Transition};
use crate::reconcile::{Phase, ReconcileReport, RunContext};

/// The run succeeded.
#[derive(Debug)]
pub(crate) struct Done {
    inventory: HostInventory,
}

impl Done {
    pub(crate) fn new(inventory: HostInventory) -> Self {
        Done { inventory }
    }
}

#[async_trait::async_trait]
impl State for Done {
    fn phase(&self) -> Phase {
        Phase::Done
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let Done { inventory } = *self;
        Transition::Complete(Ok(ReconcileReport {
            stack_name: ctx.config.stack_name.clone(),
            outputs: std::mem::take(&mut ctx.outputs),
            addresses: ctx.addresses.clone(),
            inventory,
            inventory_path: ctx.config.inventory_path.clone(),
            drained: std::mem::take(&mut ctx.drained),
        }))
    }
}
