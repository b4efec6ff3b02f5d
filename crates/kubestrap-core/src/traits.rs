use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::inventory::Host;
use crate::types::CommandOutput;

/// Transport: opens command channels to hosts (SSH, local shell, mocks).
pub trait Transport: Send + Sync + 'static {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Open a connection to `host`. Failures surface as `StrapError::Connection`.
    fn connect<'a>(&'a self, host: &'a Host) -> BoxFuture<'a, Result<Arc<dyn Connection>>>;
}

/// An open command channel to one host. Must tolerate concurrent use.
pub trait Connection: Send + Sync + 'static {
    /// Run a shell command and capture its output.
    ///
    /// A non-zero exit is not an error here; callers decide what exit codes
    /// mean. The timeout is advisory, callers enforce it as well.
    fn run_command<'a>(
        &'a self,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>>;

    /// Release the connection.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Anything that can run a command on a host (the executor, in practice).
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        host: &'a Host,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<CommandOutput>>;
}

/// Idempotency check: decides whether a step's effect is already in place.
pub trait IdempotencyCheck: Send + Sync + 'static {
    /// Name used to reference the check from plan files.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// `Ok(true)` means the step can be skipped on this host.
    fn already_satisfied<'a>(
        &'a self,
        host: &'a Host,
        runner: &'a dyn CommandRunner,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<bool>>;
}
