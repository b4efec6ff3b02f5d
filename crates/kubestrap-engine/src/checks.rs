use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use kubestrap_core::error::Result;
use kubestrap_core::inventory::Host;
use kubestrap_core::shell::quote_arg;
use kubestrap_core::traits::{CommandRunner, IdempotencyCheck};

use crate::template;

/// A check satisfied when a shell command exits 0 on the host.
///
/// The command may use `{{ host.name }}` and `{{ host.address }}`.
pub struct CommandCheck {
    name: String,
    description: String,
    command: String,
}

impl CommandCheck {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Satisfied when `path` exists on the host.
    pub fn path_exists(name: impl Into<String>, path: &str) -> Self {
        Self::new(name, format!("test -e {}", quote_arg(path)))
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl IdempotencyCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn already_satisfied<'a>(
        &'a self,
        host: &'a Host,
        runner: &'a dyn CommandRunner,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let command = template::render(&self.command, host, &BTreeMap::new());
            let output = runner.run(host, &command, timeout).await?;
            debug!(
                check = %self.name,
                host = %host.name,
                exit_code = output.exit_code,
                "Check evaluated"
            );
            Ok(output.exit_code == 0)
        })
    }
}

/// Registry of named checks that plan files can reference.
pub struct CheckRegistry {
    checks: HashMap<String, Arc<dyn IdempotencyCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self {
            checks: HashMap::new(),
        }
    }

    /// A registry holding the built-in cluster checks.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            CommandCheck::new("swap-disabled", r#"test -z "$(swapon --noheadings)""#)
                .with_description("No swap devices are active"),
        );
        registry.register(
            CommandCheck::path_exists("kubeadm-initialized", "/etc/kubernetes/admin.conf")
                .with_description("kubeadm init has completed on this node"),
        );
        registry.register(
            CommandCheck::path_exists("node-joined", "/etc/kubernetes/kubelet.conf")
                .with_description("The node has joined a cluster"),
        );
        registry.register(
            CommandCheck::new("containerd-running", "systemctl is-active --quiet containerd")
                .with_description("containerd is active"),
        );
        registry.register(
            CommandCheck::new(
                "kubeconfig-present",
                r#"test -f "$HOME/.kube/config" && cmp -s /etc/kubernetes/admin.conf "$HOME/.kube/config""#,
            )
            .with_description("The admin kubeconfig is installed for the login user"),
        );
        registry
    }

    /// Register a check, replacing any existing check with the same name.
    pub fn register(&mut self, check: impl IdempotencyCheck) {
        let name = check.name().to_string();
        self.checks.insert(name, Arc::new(check));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IdempotencyCheck>> {
        self.checks.get(name).cloned()
    }

    /// Registered check names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.checks.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for CheckRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
