//! SSH transport built on the system `ssh` client.
//!
//! Each host gets one multiplexed master connection (`ControlMaster`), so
//! the per-command cost after `connect` is a channel open, not a handshake.
//! Authentication is whatever the local ssh setup provides; kubestrap only
//! passes the identity file path through.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use kubestrap_core::config::{expand_home, SshConfig};
use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::inventory::Host;
use kubestrap_core::traits::{Connection, Transport};
use kubestrap_core::types::CommandOutput;

use crate::process::{self, wrap_command};

/// Exit status ssh itself uses for connection-level failures.
const SSH_ERROR_EXIT: i32 = 255;

pub struct SshTransport {
    config: SshConfig,
    control_dir: PathBuf,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        let control_dir = config
            .control_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            config,
            control_dir,
        }
    }

    /// Options shared by every invocation for `host`, ending with the
    /// destination.
    pub fn base_args(&self, host: &Host) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &host.identity_file {
            args.push("-i".to_string());
            args.push(expand_home(identity_file).display().to_string());
        }

        if host.port != 22 {
            args.push("-p".to_string());
            args.push(host.port.to_string());
        }

        let control_path = self.control_dir.join("kubestrap-%C");
        for option in [
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout_secs),
            "ServerAliveInterval=15".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", control_path.display()),
            format!("ControlPersist={}s", self.config.control_persist_secs),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }

        args.extend(self.config.extra_args.iter().cloned());
        args.push(format!("{}@{}", host.user, host.address));
        args
    }
}

impl Transport for SshTransport {
    fn name(&self) -> &str {
        "ssh"
    }

    fn connect<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            let conn = SshConnection {
                host: host.name.clone(),
                sudo: host.sudo,
                base_args: self.base_args(host),
            };

            // Opens the master connection and proves the host is reachable.
            let probe_timeout = Duration::from_secs(self.config.connect_timeout_secs + 5);
            conn.run_command("true", probe_timeout).await?;
            debug!(host = %host.name, address = %host.address, "SSH connection established");

            let conn: Arc<dyn Connection> = Arc::new(conn);
            Ok(conn)
        })
    }
}

struct SshConnection {
    host: String,
    sudo: bool,
    base_args: Vec<String>,
}

impl SshConnection {
    fn command_args(&self, command: &str) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--".to_string());
        args.push(wrap_command(command, self.sudo));
        args
    }
}

impl Connection for SshConnection {
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let output = process::run(&self.host, "ssh", &self.command_args(command), timeout).await?;
            if output.exit_code == SSH_ERROR_EXIT {
                return Err(StrapError::Connection {
                    host: self.host.clone(),
                    message: output.stderr.trim().to_string(),
                });
            }
            Ok(output)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut args = vec!["-O".to_string(), "exit".to_string()];
            args.extend(self.base_args.iter().cloned());
            if let Err(e) = process::run(&self.host, "ssh", &args, Duration::from_secs(5)).await {
                warn!(host = %self.host, error = %e, "Failed to close SSH master connection");
            }
        })
    }
}
