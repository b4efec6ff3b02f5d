use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use kubestrap_core::error::Result;
use kubestrap_core::inventory::Host;
use kubestrap_core::traits::{Connection, Transport};
use kubestrap_core::types::CommandOutput;

use crate::process;

/// Runs commands on the machine kubestrap itself runs on.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport;

impl LocalTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for LocalTransport {
    fn name(&self) -> &str {
        "local"
    }

    fn connect<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            debug!(host = %host.name, "Using local shell");
            let conn: Arc<dyn Connection> = Arc::new(LocalConnection::for_host(host));
            Ok(conn)
        })
    }
}

struct LocalConnection {
    host: String,
    sudo: bool,
}

impl LocalConnection {
    fn for_host(host: &Host) -> Self {
        Self {
            host: host.name.clone(),
            sudo: host.sudo,
        }
    }

    fn argv(&self, command: &str) -> (&'static str, Vec<String>) {
        if self.sudo {
            (
                "sudo",
                vec!["-n".into(), "sh".into(), "-c".into(), command.into()],
            )
        } else {
            ("sh", vec!["-c".into(), command.into()])
        }
    }
}

impl Connection for LocalConnection {
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(async move {
            let (program, args) = self.argv(command);
            process::run(&self.host, program, &args, timeout).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubestrap_core::error::StrapError;
    use kubestrap_core::inventory::ConnectionKind;

    fn localhost() -> Host {
        Host::new("localhost", "127.0.0.1").with_connection(ConnectionKind::Local)
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let transport = LocalTransport::new();
        let host = localhost();
        let conn = transport.connect(&host).await.unwrap();

        let out = conn
            .run_command("printf 'hello'; printf 'oops' >&2; exit 3", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello");
        assert_eq!(out.stderr, "oops");
    }

    #[tokio::test]
    async fn test_timeout() {
        let transport = LocalTransport::new();
        let host = localhost();
        let conn = transport.connect(&host).await.unwrap();

        let err = conn
            .run_command("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, StrapError::Timeout { .. }));
    }

    #[test]
    fn test_sudo_argv() {
        let conn = LocalConnection::for_host(&localhost().with_sudo(true));
        let (program, args) = conn.argv("id -u");
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["-n", "sh", "-c", "id -u"]);

        let (program, _) = LocalConnection::for_host(&localhost()).argv("id -u");
        assert_eq!(program, "sh");
    }
}
