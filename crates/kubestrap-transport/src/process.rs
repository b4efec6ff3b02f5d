use std::process::Stdio;
use std::time::Duration;

use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::shell::sh_c;
use kubestrap_core::types::CommandOutput;

/// The command line a host should execute for `command`, honoring `sudo`.
pub fn wrap_command(command: &str, sudo: bool) -> String {
    if sudo {
        format!("sudo -n {}", sh_c(command))
    } else {
        sh_c(command)
    }
}

/// Spawn a local process and capture its output.
///
/// The child is killed if the returned future is dropped, which is how
/// callers' timeouts reach the process.
pub(crate) async fn run(
    host: &str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput> {
    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StrapError::Connection {
            host: host.to_string(),
            message: format!("failed to spawn {}: {}", program, e),
        })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| StrapError::Timeout {
            host: host.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })??;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
