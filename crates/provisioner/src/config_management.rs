//! The configuration-management collaborator that configures the cluster once
//! the infrastructure is up.
use std::path::Path;

use async_trait::async_trait;

/// How a configuration-management run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    /// Exit code; `None` if the process was killed by a signal
    pub code: Option<i32>,
}

impl RunOutcome {
    /// Whether the run exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Applies a playbook to the hosts of an inventory file.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait ConfigManagement: Send + Sync {
    /// Run `playbook` against `inventory` and wait for it to finish.
    ///
    /// `Err` is reserved for failing to start the run at all.
    async fn apply(&self, inventory: &Path, playbook: &Path) -> anyhow::Result<RunOutcome>;
}
