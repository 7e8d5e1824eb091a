use tracing::{debug, info, warn};

use super::provisioning::Provisioning;
use crate::address::AddressResolver;
use crate::drain::{DrainError, KubectlControlPlane, NodeDrainer};
use crate::error::ReconcileError;
use crate::poll::{PollOutcome, RetryPolicy};
use crate::reconcile::state::{require_done, State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};
use crate::remote::SshTarget;
use crate::stack::StackStatus;

/// Removes the previous cluster: drains its workers, then deletes the stack
/// and waits until the provider no longer reports it.
#[derive(Debug)]
pub(crate) struct CleanupExisting {
    status: StackStatus,
}

impl CleanupExisting {
    pub(crate) fn new(status: StackStatus) -> Self {
        CleanupExisting { status }
    }
}

impl TransitionTo<Provisioning> for CleanupExisting {}

#[async_trait::async_trait]
impl State for CleanupExisting {
    fn phase(&self) -> Phase {
        Phase::CleanupExisting
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        let cluster_running = matches!(
            self.status,
            StackStatus::CreateComplete | StackStatus::UpdateComplete
        );
        if !config.drain_nodes {
            info!(stack = %config.stack_name, "Node drain disabled, deleting stack directly");
        } else if !cluster_running {
            info!(
                stack = %config.stack_name,
                status = %self.status,
                "Stack never completed, no cluster to drain"
            );
        } else if let Err(e) = drain_workers(ctx).await {
            return Transition::Complete(Err(e));
        }

        info!(stack = %config.stack_name, "Deleting stack");
        if let Err(e) = ctx.cloud.delete(&config.stack_name).await {
            return Transition::Complete(Err(ctx.provision_error("stack delete", e)));
        }

        let cloud = ctx.cloud;
        let name = config.stack_name.as_str();
        let what = format!("deletion of stack {}", name);
        let policy = RetryPolicy::unbounded(config.delete_poll_interval, config.cleanup_timeout);
        let result = ctx
            .poller
            .poll_until(&what, &policy, move || async move {
                match cloud.describe(name).await {
                    Ok(None) => PollOutcome::Done(()),
                    Ok(Some(stack)) if stack.status == StackStatus::DeleteFailed => {
                        PollOutcome::Failed(
                            stack
                                .status_reason
                                .unwrap_or_else(|| stack.status.to_string()),
                        )
                    }
                    Ok(Some(stack)) => PollOutcome::Pending(stack.status.to_string()),
                    Err(e) => PollOutcome::Pending(format!("stack show failed: {}", e)),
                }
            })
            .await;

        match require_done(&what, &policy, result) {
            Ok(()) => {
                info!(stack = %name, "Existing stack deleted");
                ctx.stack_status = None;
                // Addresses of the deleted instances must not outlive them.
                ctx.addresses.clear();
                Transition::next(self, Provisioning)
            }
            Err(e) => {
                if let ReconcileError::PollFailed { .. } = e {
                    ctx.stack_status = Some(StackStatus::DeleteFailed);
                }
                Transition::Complete(Err(e))
            }
        }
    }
}

/// Drain every configured worker that still has an instance in the stack,
/// running `kubectl` on the first master.
///
/// An unreachable master skips draining; the stack is deleted regardless.
async fn drain_workers(ctx: &mut RunContext<'_>) -> Result<(), ReconcileError> {
    let config = ctx.config;
    let resolver = AddressResolver::new(ctx.cloud);

    let master = match config.masters().next() {
        Some(master) => master,
        None => return Ok(()),
    };
    let entry = match resolver.resolve(&master.name).await {
        Ok(address) => address,
        Err(e) => {
            warn!(error = %e, "Unable to resolve the existing master, skipping node drain");
            return Ok(());
        }
    };
    let entry_ip = match entry.connect_ip() {
        Some(ip) => ip,
        None => return Ok(()),
    };
    let target = SshTarget::new(entry_ip.to_string(), config.master_user.clone());
    match ctx.remote.probe(&target).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(%target, "Existing master is not reachable over SSH, skipping node drain");
            return Ok(());
        }
        Err(e) => {
            warn!(%target, error = %e, "Unable to probe the existing master, skipping node drain");
            return Ok(());
        }
    }
    ctx.addresses.insert(master.name.clone(), entry);

    let drainer = NodeDrainer::new(KubectlControlPlane::new(ctx.remote, target));
    for worker in config.workers() {
        if let Err(e) = resolver.resolve(&worker.name).await {
            debug!(node = %worker.name, error = %e, "Worker has no instance in the stack, skipping");
            continue;
        }
        match drainer.drain(&worker.name, config.drain_timeout).await {
            Ok(result) => {
                if result.removed {
                    info!(
                        node = %worker.name,
                        forced = result.forcibly_deleted_pods.len(),
                        "Removed node from the cluster"
                    );
                }
                ctx.drained.push(result);
            }
            Err(DrainError::Lookup { node, source }) => {
                warn!(%node, error = %source, "Unable to look up node, leaving it to the stack deletion");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
