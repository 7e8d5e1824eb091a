use std::ffi::OsStr;

use provisioner::remote::CommandOutput;
use tokio::process::Command;
use tracing::trace;

/// Run a program to completion and capture its output.
pub(crate) async fn capture<I, S>(program: &str, args: I) -> anyhow::Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    trace!(?command, "Spawning process");
    let output = command
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("unable to run {}: {}", program, e))?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
