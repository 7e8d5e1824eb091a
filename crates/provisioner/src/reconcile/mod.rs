//! Drives a stack from whatever state it is in to a freshly provisioned,
//! reachable and configured cluster.
//!
//! A run walks the phases
//! `START → CLEANUP_EXISTING → PROVISIONING → AWAITING_CONVERGENCE →
//! RESOLVING_ADDRESSES → AWAITING_REACHABILITY → HANDOFF → DONE` and stops at
//! the first fatal error, returning a [`Failure`] that records the phase it
//! reached. All state lives in the cloud and is re-derived on every run.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::address::InstanceAddress;
use crate::config::Config;
use crate::config_management::ConfigManagement;
use crate::drain::DrainResult;
use crate::error::{Failure, Observed, ReconcileError};
use crate::inventory::HostInventory;
use crate::poll::ReadinessPoller;
use crate::remote::RemoteExecutor;
use crate::stack::{CloudStackClient, StackStatus};

pub(crate) mod state;
mod states;

/// The phases of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Looking for an existing stack
    Start,
    /// Draining the old cluster and deleting its stack
    CleanupExisting,
    /// Asking the provider to create the stack
    Provisioning,
    /// Waiting for the stack to reach a terminal status
    AwaitingConvergence,
    /// Looking up instance addresses
    ResolvingAddresses,
    /// Waiting for SSH on every host with a floating IP
    AwaitingReachability,
    /// Writing the inventory and running configuration management
    Handoff,
    /// The run succeeded
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Start => "START",
            Phase::CleanupExisting => "CLEANUP_EXISTING",
            Phase::Provisioning => "PROVISIONING",
            Phase::AwaitingConvergence => "AWAITING_CONVERGENCE",
            Phase::ResolvingAddresses => "RESOLVING_ADDRESSES",
            Phase::AwaitingReachability => "AWAITING_REACHABILITY",
            Phase::Handoff => "HANDOFF",
            Phase::Done => "DONE",
        };
        f.write_str(s)
    }
}

/// The outside world a run talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// The orchestration service
    pub cloud: Arc<dyn CloudStackClient>,
    /// Remote command execution on cluster hosts
    pub remote: Arc<dyn RemoteExecutor>,
    /// Configuration management run at hand-off
    pub config_management: Arc<dyn ConfigManagement>,
}

/// The result of a successful run.
#[derive(Clone, Debug)]
pub struct ReconcileReport {
    /// The stack that was provisioned
    pub stack_name: String,
    /// Stack outputs at convergence
    pub outputs: BTreeMap<String, String>,
    /// Resolved addresses keyed by instance name
    pub addresses: BTreeMap<String, InstanceAddress>,
    /// The inventory handed to configuration management
    pub inventory: HostInventory,
    /// Where the inventory was written
    pub inventory_path: PathBuf,
    /// Nodes removed from the previous cluster
    pub drained: Vec<DrainResult>,
}

/// Reconciles a single stack.
pub struct Reconciler {
    config: Arc<Config>,
    collaborators: Collaborators,
    cancel: CancellationToken,
}

impl Reconciler {
    /// Create a reconciler for the stack named in `config`.
    pub fn new(config: Arc<Config>, collaborators: Collaborators) -> Self {
        Reconciler {
            config,
            collaborators,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token, e.g. one wired to Ctrl-C.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that cancels this reconciler's runs.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the reconciliation to completion.
    pub async fn run(&self) -> Result<ReconcileReport, Failure> {
        let config = self.config.as_ref();
        let started = Instant::now();
        // Out of range deadlines are rejected by `Config::validate`; one that
        // slipped through means no deadline.
        let deadline = config.deadline.and_then(|d| started.checked_add(d));
        let mut ctx = RunContext {
            config,
            cloud: self.collaborators.cloud.as_ref(),
            remote: self.collaborators.remote.as_ref(),
            config_management: self.collaborators.config_management.as_ref(),
            poller: ReadinessPoller::new(self.cancel.clone()),
            cancel: self.cancel.clone(),
            stack_status: None,
            outputs: BTreeMap::new(),
            addresses: BTreeMap::new(),
            drained: Vec::new(),
        };

        match state::run_to_completion(states::Start, &mut ctx, deadline).await {
            Ok(report) => {
                info!(
                    stack = %config.stack_name,
                    elapsed = ?started.elapsed(),
                    "Cluster provisioned and configured"
                );
                Ok(report)
            }
            Err((phase, error)) => Err(Failure {
                phase,
                error,
                observed: Observed {
                    stack_status: ctx.stack_status,
                    addresses: ctx.addresses.into_values().collect(),
                },
            }),
        }
    }
}

/// Everything the states of one run share.
pub(crate) struct RunContext<'a> {
    pub(crate) config: &'a Config,
    pub(crate) cloud: &'a dyn CloudStackClient,
    pub(crate) remote: &'a dyn RemoteExecutor,
    pub(crate) config_management: &'a dyn ConfigManagement,
    pub(crate) poller: ReadinessPoller,
    pub(crate) cancel: CancellationToken,
    pub(crate) stack_status: Option<StackStatus>,
    pub(crate) outputs: BTreeMap<String, String>,
    pub(crate) addresses: BTreeMap<String, InstanceAddress>,
    pub(crate) drained: Vec<DrainResult>,
}

impl<'a> RunContext<'a> {
    pub(crate) fn provision_error(
        &self,
        operation: &'static str,
        source: anyhow::Error,
    ) -> ReconcileError {
        ReconcileError::Provision {
            stack: self.config.stack_name.clone(),
            operation,
            source,
        }
    }
}
