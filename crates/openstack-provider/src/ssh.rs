use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use provisioner::remote::{CommandOutput, RemoteExecutor, SshTarget};
use tracing::{debug, trace};

use crate::command::capture;

// ssh exits with 255 when the connection itself fails.
const SSH_CONNECTION_FAILED: i32 = 255;

/// A [`RemoteExecutor`] backed by the OpenSSH client.
///
/// Runs non-interactively: password prompts are disabled and unknown host
/// keys are accepted, since every host is freshly created.
#[derive(Clone, Debug)]
pub struct SshExecutor {
    program: String,
    key: Option<PathBuf>,
    connect_timeout: Duration,
}

impl SshExecutor {
    /// Use `ssh` from `PATH` with the given connect timeout.
    pub fn new(connect_timeout: Duration) -> Self {
        SshExecutor {
            program: "ssh".to_owned(),
            key: None,
            connect_timeout,
        }
    }

    /// Authenticate with this private key.
    pub fn with_key(mut self, key: Option<PathBuf>) -> Self {
        self.key = key;
        self
    }

    /// Use a different executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn args(&self, target: &SshTarget, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_owned(),
            "BatchMode=yes".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            "UserKnownHostsFile=/dev/null".to_owned(),
            "-o".to_owned(),
            "LogLevel=ERROR".to_owned(),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_owned());
            args.push(key.display().to_string());
        }
        args.push(target.to_string());
        args.push(command.to_owned());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn probe(&self, target: &SshTarget) -> anyhow::Result<bool> {
        let output = capture(&self.program, self.args(target, "true")).await?;
        if !output.success() {
            trace!(%target, code = ?output.code, stderr = %output.stderr.trim(), "Probe failed");
        }
        Ok(output.success())
    }

    async fn run(&self, target: &SshTarget, command: &str) -> anyhow::Result<CommandOutput> {
        debug!(%target, command, "Running remote command");
        let output = capture(&self.program, self.args(target, command)).await?;
        if output.code == Some(SSH_CONNECTION_FAILED) {
            anyhow::bail!(
                "unable to connect to {}: {}",
                target,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn args_are_non_interactive() {
        let ssh = SshExecutor::new(Duration::from_secs(10));
        let args = ssh.args(&SshTarget::new("192.168.1.124", "ubuntu"), "true");
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=10",
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "ubuntu@192.168.1.124",
                "true",
            ]
        );
    }

    #[test]
    fn key_goes_before_the_destination() {
        let ssh = SshExecutor::new(Duration::from_millis(500))
            .with_key(Some(PathBuf::from("/home/ops/.ssh/lab")));
        let args = ssh.args(
            &SshTarget::new("192.168.1.124", "ubuntu"),
            "kubectl get nodes",
        );
        assert!(args.contains(&"ConnectTimeout=1".to_owned()));
        let tail: Vec<&str> = args[args.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["-i", "/home/ops/.ssh/lab", "ubuntu@192.168.1.124", "kubectl get nodes"]
        );
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_an_error() {
        let ssh = SshExecutor::new(Duration::from_secs(1)).with_program("/nonexistent/ssh");
        let result = ssh.probe(&SshTarget::new("192.0.2.1", "ubuntu")).await;
        assert!(result.is_err());
    }
}
