use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use provisioner::config_management::{ConfigManagement, RunOutcome};
use tokio::process::Command;
use tracing::info;

/// A [`ConfigManagement`] that runs `ansible-playbook`.
///
/// Output goes straight to the terminal so the operator can follow the run.
#[derive(Clone, Debug)]
pub struct AnsiblePlaybook {
    program: String,
}

impl Default for AnsiblePlaybook {
    fn default() -> Self {
        AnsiblePlaybook {
            program: "ansible-playbook".to_owned(),
        }
    }
}

impl AnsiblePlaybook {
    /// Use `ansible-playbook` from `PATH`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, inventory: &Path, playbook: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("-i")
            .arg(inventory)
            .arg(playbook)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        command
    }
}

#[async_trait]
impl ConfigManagement for AnsiblePlaybook {
    async fn apply(&self, inventory: &Path, playbook: &Path) -> anyhow::Result<RunOutcome> {
        info!(
            inventory = %inventory.display(),
            playbook = %playbook.display(),
            "Running ansible-playbook"
        );
        let status = self
            .command(inventory, playbook)
            .status()
            .await
            .map_err(|e| anyhow::anyhow!("unable to run {}: {}", self.program, e))?;
        Ok(RunOutcome {
            code: status.code(),
        })
    }
}
