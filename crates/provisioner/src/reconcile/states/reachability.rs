use tracing::{debug, info};

use super::handoff::Handoff;
use crate::poll::{PollOutcome, RetryPolicy};
use crate::reconcile::state::{require_done, State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};
use crate::remote::SshTarget;

/// Waits until every host with a floating IP accepts SSH logins, one host at
/// a time in configuration order.
#[derive(Debug, Default)]
pub(crate) struct AwaitingReachability;

impl TransitionTo<Handoff> for AwaitingReachability {}

#[async_trait::async_trait]
impl State for AwaitingReachability {
    fn phase(&self) -> Phase {
        Phase::AwaitingReachability
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        let remote = ctx.remote;
        let policy = RetryPolicy::bounded(config.ssh_attempts, config.ssh_interval);

        for host in &config.hosts {
            let ip = match ctx.addresses.get(&host.name).and_then(|a| a.floating_ip) {
                Some(ip) => ip,
                None => {
                    debug!(host = %host.name, "No floating IP, skipping reachability check");
                    continue;
                }
            };
            let target = SshTarget::new(ip.to_string(), config.ssh_user(host.role));
            let what = format!("SSH on {} ({})", host.name, target);
            let probe_target = &target;

            let result = ctx
                .poller
                .poll_until(&what, &policy, move || async move {
                    match remote.probe(probe_target).await {
                        Ok(true) => PollOutcome::Done(()),
                        Ok(false) => PollOutcome::Pending("connection refused or login denied".to_owned()),
                        Err(e) => PollOutcome::Pending(e.to_string()),
                    }
                })
                .await;
            if let Err(e) = require_done(&what, &policy, result) {
                return Transition::Complete(Err(e));
            }
            info!(host = %host.name, %target, "Host is reachable");
        }

        Transition::next(self, Handoff)
    }
}
