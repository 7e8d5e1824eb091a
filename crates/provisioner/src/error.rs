//! The error taxonomy of a reconciliation run and the operator-facing
//! failure report.
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::address::InstanceAddress;
use crate::config::Config;
use crate::drain::DrainError;
use crate::inventory::InventoryError;
use crate::poll::PollError;
use crate::reconcile::Phase;
use crate::stack::{ResourceFailure, StackEvent, StackStatus};

/// Exit code for a fully successful run
pub const EXIT_CODE_SUCCESS: i32 = 0;
/// Exit code when provisioning the infrastructure failed
pub const EXIT_CODE_PROVISIONING_FAILED: i32 = 1;
/// Exit code when the infrastructure is up but configuration management failed
pub const EXIT_CODE_CONFIGURATION_FAILED: i32 = 2;
/// Exit code when the operator cancelled the run
pub const EXIT_CODE_CANCELLED: i32 = 3;
/// Exit code for invalid flags or configuration
pub const EXIT_CODE_INVALID_CONFIG: i32 = 4;

/// Everything that can stop a reconciliation run.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The provider rejected or failed a stack or instance operation.
    #[error("{operation} for stack {stack} failed: {source}")]
    Provision {
        /// The stack being reconciled
        stack: String,
        /// The provider operation, e.g. `stack create`
        operation: &'static str,
        /// Underlying provider error
        source: anyhow::Error,
    },
    /// A wait did not converge in time.
    #[error("timed out waiting for {what} after {attempts} attempts (last observed: {}){}", .last_observed.as_deref().unwrap_or("nothing"), format_events(.events))]
    PollTimeout {
        /// What was being waited for
        what: String,
        /// How many checks were made
        attempts: u32,
        /// The last status seen
        last_observed: Option<String>,
        /// Recent stack events, when the wait was on the stack
        events: Vec<StackEvent>,
    },
    /// A wait observed a terminal failure.
    #[error("{what} failed: {cause}{}", format_resources(.failed_resources))]
    PollFailed {
        /// What was being waited for
        what: String,
        /// The failure reported by the provider
        cause: String,
        /// Resources that failed, when the wait was on the stack
        failed_resources: Vec<ResourceFailure>,
    },
    /// An expected instance has no address.
    #[error("no address found for instance {instance}")]
    AddressNotFound {
        /// The instance name
        instance: String,
    },
    /// A node could not be removed from the running cluster.
    #[error(transparent)]
    NodeRemoval(#[from] DrainError),
    /// The inventory could not be built.
    #[error("invalid inventory: {0}")]
    InvalidInventory(#[from] InventoryError),
    /// The inventory could not be written.
    #[error("unable to write inventory to {}: {source}", .path.display())]
    InventoryWrite {
        /// Target path
        path: PathBuf,
        /// Underlying error
        source: anyhow::Error,
    },
    /// Configuration management could not be started.
    #[error("unable to run configuration management: {0}")]
    ConfigManagementLaunch(anyhow::Error),
    /// Configuration management exited unsuccessfully.
    #[error("configuration management run of {} exited with {}", .playbook.display(), format_code(.code))]
    ConfigManagementFailed {
        /// The playbook that ran
        playbook: PathBuf,
        /// Exit code, `None` if killed by a signal
        code: Option<i32>,
    },
    /// The global deadline passed between two steps.
    #[error("deployment deadline of {}s exceeded", .0.as_secs())]
    DeadlineExceeded(Duration),
    /// The operator cancelled the run.
    #[error("cancelled by the operator")]
    Cancelled,
}

fn format_events(events: &[StackEvent]) -> String {
    if events.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = events.iter().map(|e| format!("\n  {}", e)).collect();
    format!("; recent stack events:{}", lines.concat())
}

fn format_resources(resources: &[ResourceFailure]) -> String {
    if resources.is_empty() {
        return String::new();
    }
    let names: Vec<String> = resources.iter().map(ToString::to_string).collect();
    format!("; failed resources: {}", names.join(", "))
}

fn format_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by a signal)".to_owned(),
    }
}

impl From<PollError> for ReconcileError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::Timeout {
                what,
                attempts,
                last_observed,
            } => ReconcileError::PollTimeout {
                what,
                attempts,
                last_observed,
                events: Vec::new(),
            },
            PollError::Failed { what, cause } => ReconcileError::PollFailed {
                what,
                cause,
                failed_resources: Vec::new(),
            },
            PollError::Cancelled { .. } => ReconcileError::Cancelled,
        }
    }
}

impl ReconcileError {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconcileError::ConfigManagementLaunch(_)
            | ReconcileError::ConfigManagementFailed { .. } => EXIT_CODE_CONFIGURATION_FAILED,
            ReconcileError::Cancelled => EXIT_CODE_CANCELLED,
            _ => EXIT_CODE_PROVISIONING_FAILED,
        }
    }

    /// Whether the infrastructure was left provisioned on purpose.
    pub fn infrastructure_intact(&self) -> bool {
        self.exit_code() == EXIT_CODE_CONFIGURATION_FAILED
    }
}

/// What was last observed before a run failed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Observed {
    /// Last known stack status, `None` if the stack did not exist
    pub stack_status: Option<StackStatus>,
    /// Addresses resolved so far
    pub addresses: Vec<InstanceAddress>,
}

/// A failed run: the phase it reached, why it stopped and what it saw.
#[derive(Debug)]
pub struct Failure {
    /// The phase that failed
    pub phase: Phase,
    /// Why it failed
    pub error: ReconcileError,
    /// Last observations
    pub observed: Observed,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reconciliation failed in {}: {}", self.phase, self.error)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl Failure {
    /// The process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        self.error.exit_code()
    }

    /// Commands the operator can run next.
    pub fn remediation(&self, config: &Config) -> Vec<String> {
        let stack = &config.stack_name;
        let inventory = config.inventory_path.display();
        let playbook = config.playbook.display();
        let mut steps = Vec::new();

        match &self.error {
            ReconcileError::ConfigManagementFailed { .. }
            | ReconcileError::ConfigManagementLaunch(_) => {
                steps.push(format!(
                    "The stack {} was left running. Inspect the inventory: cat {}",
                    stack, inventory
                ));
                steps.push(format!(
                    "Retry configuration only: ansible-playbook -i {} {}",
                    inventory, playbook
                ));
            }
            ReconcileError::PollFailed { .. } | ReconcileError::PollTimeout { .. }
                if self.phase == Phase::AwaitingReachability =>
            {
                for address in &self.observed.addresses {
                    if let Some(ip) = address.floating_ip {
                        steps.push(format!(
                            "Check SSH access: ssh {}@{} true",
                            config.ssh_user_for(&address.instance_name),
                            ip
                        ));
                    }
                }
            }
            ReconcileError::PollFailed { .. } | ReconcileError::PollTimeout { .. } => {
                steps.push(format!("Inspect the stack: openstack stack show {}", stack));
                steps.push(format!(
                    "List failed resources: openstack stack resource list {} --filter status=FAILED",
                    stack
                ));
                steps.push(format!(
                    "Read the event log: openstack stack event list {}",
                    stack
                ));
            }
            ReconcileError::NodeRemoval(_) => {
                if let Some(master) = self
                    .observed
                    .addresses
                    .iter()
                    .find(|a| config.is_master(&a.instance_name))
                    .and_then(|a| a.connect_ip())
                {
                    steps.push(format!(
                        "Inspect cluster membership: ssh {}@{} kubectl get nodes",
                        config.master_user, master
                    ));
                }
            }
            ReconcileError::Cancelled | ReconcileError::DeadlineExceeded(_) => {
                steps.push(format!(
                    "Check whether the stack is still changing: openstack stack show {}",
                    stack
                ));
            }
            _ => {}
        }

        if !self.error.infrastructure_intact() && self.phase != Phase::Start {
            steps.push(format!(
                "Remove the stack by hand if needed: openstack stack delete --yes {}",
                stack
            ));
        }
        steps.push("Re-run stackup with the same flags once the cause is fixed".to_owned());
        steps
    }
}
