use std::collections::BTreeMap;

use tracing::info;

use super::done::Done;
use crate::error::ReconcileError;
use crate::inventory::{InventoryBuilder, RoleAssignment};
use crate::reconcile::state::{State, Transition, TransitionTo};
use crate::reconcile::{Phase, RunContext};

/// Writes the inventory and runs configuration management against it.
///
/// A failure here leaves the infrastructure in place.
#[derive(Debug, Default)]
pub(crate) struct Handoff;

impl TransitionTo<Done> for Handoff {}

#[async_trait::async_trait]
impl State for Handoff {
    fn phase(&self) -> Phase {
        Phase::Handoff
    }

    async fn next(self: Box<Self>, ctx: &mut RunContext<'_>) -> Transition {
        let config = ctx.config;

        let assignments: BTreeMap<String, RoleAssignment> = config
            .hosts
            .iter()
            .filter_map(|host| {
                let address = ctx.addresses.get(&host.name)?;
                Some((
                    host.name.clone(),
                    RoleAssignment {
                        role: host.role,
                        address: address.clone(),
                        ssh_user: config.ssh_user(host.role).to_owned(),
                    },
                ))
            })
            .collect();

        let mut builder = config
            .inventory_vars
            .iter()
            .fold(InventoryBuilder::new(), |builder, (key, value)| {
                builder.with_var(key.clone(), value.clone())
            });
        if let Some(key) = &config.ssh_key {
            builder = builder.with_var("ansible_ssh_private_key_file", key.display().to_string());
        }
        let inventory = match builder.build(&assignments) {
            Ok(inventory) => inventory,
            Err(e) => return Transition::Complete(Err(e.into())),
        };

        if let Err(source) = inventory.write_to(&config.inventory_path).await {
            return Transition::Complete(Err(ReconcileError::InventoryWrite {
                path: config.inventory_path.clone(),
                source,
            }));
        }
        info!(path = %config.inventory_path.display(), hosts = assignments.len(), "Wrote inventory");

        info!(playbook = %config.playbook.display(), "Handing off to configuration management");
        match ctx
            .config_management
            .apply(&config.inventory_path, &config.playbook)
            .await
        {
            Ok(outcome) if outcome.success() => Transition::next(self, Done::new(inventory)),
            Ok(outcome) => Transition::Complete(Err(ReconcileError::ConfigManagementFailed {
                playbook: config.playbook.clone(),
                code: outcome.code,
            })),
            Err(e) => Transition::Complete(Err(ReconcileError::ConfigManagementLaunch(e))),
        }
    }
}
