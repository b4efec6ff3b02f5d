pub mod local;
pub mod process;
pub mod ssh;

use std::sync::Arc;

use futures::future::BoxFuture;

use kubestrap_core::config::SshConfig;
use kubestrap_core::error::Result;
use kubestrap_core::inventory::{ConnectionKind, Host};
use kubestrap_core::traits::{Connection, Transport};

pub use local::LocalTransport;
pub use ssh::SshTransport;

/// Picks the transport for each host from its `connection` setting.
pub struct TransportRouter {
    ssh: Arc<dyn Transport>,
    local: Arc<dyn Transport>,
}

impl TransportRouter {
    pub fn new(ssh: Arc<dyn Transport>, local: Arc<dyn Transport>) -> Self {
        Self { ssh, local }
    }

    /// The router used by the CLI: system ssh plus the local shell.
    pub fn from_config(config: &SshConfig) -> Self {
        Self::new(
            Arc::new(SshTransport::new(config.clone())),
            Arc::new(LocalTransport::new()),
        )
    }

    fn route(&self, host: &Host) -> &Arc<dyn Transport> {
        match host.connection {
            ConnectionKind::Ssh => &self.ssh,
            ConnectionKind::Local => &self.local,
        }
    }
}

impl Transport for TransportRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn connect<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<Arc<dyn Connection>>> {
        self.route(host).connect(host)
    }
}
