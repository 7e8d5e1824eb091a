use std::net::Ipv4Addr;

use tracing::{info, warn};

use super::reachability::AwaitingReachability;
use crate::address::{AddressResolver, ResolveError};
use crate::error::ReconcileError;
use crate::reconcile::state::{State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};

/// Resolves the addresses of every configured host.
#[derive(Debug, Default)]
pub(crate) struct ResolvingAddresses;

impl TransitionTo<AwaitingReachability> for ResolvingAddresses {}

#[async_trait::async_trait]
impl State for ResolvingAddresses {
    fn phase(&self) -> Phase {
        Phase::ResolvingAddresses
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;
        let resolver = AddressResolver::new(ctx.cloud);
        ctx.addresses.clear();

        for host in &config.hosts {
            let mut address = match resolver.resolve(&host.name).await {
                Ok(address) => address,
                Err(ResolveError::AddressNotFound(instance)) => {
                    return Transition::Complete(Err(ReconcileError::AddressNotFound { instance }))
                }
                Err(ResolveError::Lookup { source, .. }) => {
                    return Transition::Complete(Err(ctx.provision_error("server show", source)))
                }
            };

            if let Some(output) = &host.floating_ip_output {
                match ctx.outputs.get(output).map(|v| v.trim().parse::<Ipv4Addr>()) {
                    Some(Ok(ip)) => address.floating_ip = Some(ip),
                    Some(Err(_)) => warn!(
                        host = %host.name,
                        %output,
                        "Stack output is not an IPv4 address, keeping the listed floating IP"
                    ),
                    None => warn!(
                        host = %host.name,
                        %output,
                        "Stack has no such output, keeping the listed floating IP"
                    ),
                }
            }

            info!(role = %host.role, %address, "Resolved instance");
            ctx.addresses.insert(host.name.clone(), address);
        }

        Transition::next(self, AwaitingReachability)
    }
}
