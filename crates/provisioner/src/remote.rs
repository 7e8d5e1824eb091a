//! The remote execution collaborator (SSH).
use std::fmt;

use async_trait::async_trait;

/// A user on a host reachable over SSH.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    /// Host name or address
    pub host: String,
    /// Login user
    pub user: String,
}

impl SshTarget {
    /// Create a new target
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        SshTarget {
            host: host.into(),
            user: user.into(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// The captured result of a remote command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs commands on remote hosts.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait).
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Check whether the target accepts a login and runs a trivial command.
    ///
    /// `Ok(false)` means the host is not reachable yet; `Err` means the probe
    /// itself could not be started.
    async fn probe(&self, target: &SshTarget) -> anyhow::Result<bool>;

    /// Run a shell command on the target and capture its output. A non-zero
    /// exit is reported in [`CommandOutput::code`], not as an error.
    async fn run(&self, target: &SshTarget, command: &str) -> anyhow::Result<CommandOutput>;
}
