use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use kubestrap_core::error::{Result, StrapError};
use kubestrap_core::inventory::Host;
use kubestrap_core::traits::{CommandRunner, Connection, Transport};
use kubestrap_core::types::CommandOutput;

/// Runs commands on hosts through a [`Transport`], one pooled connection
/// per host.
///
/// The executor never retries; retry policy belongs to the engine. A
/// connection error evicts the pooled connection so the next call
/// reconnects.
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<String, Slot>>,
}

type Slot = Arc<Mutex<Option<Arc<dyn Connection>>>>;

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Run `command` on `host`, failing with `Timeout` once `timeout` elapses.
    ///
    /// The in-flight command future is dropped on timeout, which kills the
    /// local process backing it.
    pub async fn execute(
        &self,
        host: &Host,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let conn = self.connection(host).await?;
        debug!(host = %host.name, command = %command, "Executing command");

        match tokio::time::timeout(timeout, conn.run_command(command, timeout)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                if matches!(e, StrapError::Connection { .. }) {
                    self.evict(&host.name).await;
                }
                Err(e)
            }
            Err(_) => Err(StrapError::Timeout {
                host: host.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn connection(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        let slot = {
            let mut slots = self.connections.lock().await;
            slots.entry(host.name.clone()).or_default().clone()
        };

        // Held across connect: concurrent tasks on one host share a single
        // connection, other hosts are not blocked.
        let mut slot = slot.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = self.transport.connect(host).await?;
        debug!(host = %host.name, transport = %self.transport.name(), "Connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn evict(&self, host: &str) {
        let slot = self.connections.lock().await.get(host).cloned();
        let removed = match slot {
            Some(slot) => slot.lock().await.take(),
            None => None,
        };
        if let Some(conn) = removed {
            warn!(host = %host, "Dropping pooled connection after transport failure");
            conn.close().await;
        }
    }

    /// Close every pooled connection.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = self.connections.lock().await.drain().collect();
        for (host, slot) in slots {
            if let Some(conn) = slot.lock().await.take() {
                debug!(host = %host, "Closing connection");
                conn.close().await;
            }
        }
    }

    pub async fn pooled_connections(&self) -> usize {
        let slots: Vec<Slot> = self.connections.lock().await.values().cloned().collect();
        let mut open = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                open += 1;
            }
        }
        open
    }
}

impl CommandRunner for RemoteExecutor {
    fn run<'a>(
        &'a self,
        host: &'a Host,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(self.execute(host, command, timeout))
    }
}
