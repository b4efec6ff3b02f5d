use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{load_toml_with_env, SshConfig};
use crate::error::{Result, StrapError};

/// Host group membership. Every host is implicitly a member of `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostGroup {
    All,
    ControlPlane,
    Worker,
}

impl fmt::Display for HostGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::ControlPlane => write!(f, "control-plane"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// How commands reach a host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    #[default]
    Ssh,
    Local,
}

/// A machine in the fleet with its resolved connection details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    /// Credentials reference; the key material itself is never loaded.
    pub identity_file: Option<String>,
    pub connection: ConnectionKind,
    pub groups: Vec<HostGroup>,
    /// Run commands through `sudo -n`.
    #[serde(default)]
    pub sudo: bool,
}

impl Host {
    /// Create a host reachable over SSH with default credentials.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        let defaults = SshConfig::default();
        Self {
            name: name.into(),
            address: address.into(),
            port: defaults.port,
            user: defaults.user,
            identity_file: None,
            connection: ConnectionKind::Ssh,
            groups: vec![],
            sudo: false,
        }
    }

    /// Add a group membership.
    pub fn with_group(mut self, group: HostGroup) -> Self {
        if !self.groups.contains(&group) {
            self.groups.push(group);
        }
        self
    }

    pub fn with_connection(mut self, connection: ConnectionKind) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn in_group(&self, group: HostGroup) -> bool {
        group == HostGroup::All || self.groups.contains(&group)
    }
}

/// Inventory file entry before SSH defaults are applied.
#[derive(Debug, Clone, Deserialize)]
struct HostEntry {
    name: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    identity_file: Option<String>,
    #[serde(default)]
    connection: ConnectionKind,
    #[serde(default)]
    groups: Vec<HostGroup>,
    #[serde(default)]
    sudo: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    hosts: Vec<HostEntry>,
}

/// The ordered set of hosts a plan runs against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    hosts: Vec<Host>,
}

impl Inventory {
    /// Build an inventory, rejecting duplicate host names.
    pub fn new(hosts: Vec<Host>) -> Result<Self> {
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.name.as_str()) {
                return Err(StrapError::DuplicateHost(host.name.clone()));
            }
        }
        Ok(Self { hosts })
    }

    /// Load an inventory TOML file, filling unset fields from `defaults`.
    pub fn load(path: &Path, defaults: &SshConfig) -> Result<Self> {
        let file: InventoryFile = load_toml_with_env(path)?;
        let inventory = Self::from_entries(file.hosts, defaults)?;
        debug!(path = %path.display(), hosts = inventory.len(), "Loaded inventory");
        Ok(inventory)
    }

    /// Parse an inventory from a TOML string.
    pub fn from_toml(content: &str, defaults: &SshConfig) -> Result<Self> {
        let file: InventoryFile =
            toml::from_str(content).map_err(|e| StrapError::Config(e.to_string()))?;
        Self::from_entries(file.hosts, defaults)
    }

    fn from_entries(entries: Vec<HostEntry>, defaults: &SshConfig) -> Result<Self> {
        let hosts = entries
            .into_iter()
            .map(|e| Host {
                address: e.address.unwrap_or_else(|| e.name.clone()),
                name: e.name,
                port: e.port.unwrap_or(defaults.port),
                user: e.user.unwrap_or_else(|| defaults.user.clone()),
                identity_file: e.identity_file.or_else(|| defaults.identity_file.clone()),
                connection: e.connection,
                groups: e.groups,
                sudo: e.sudo,
            })
            .collect();
        Self::new(hosts)
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn get(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// Position of a host in inventory order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.hosts.iter().position(|h| h.name == name)
    }

    /// Hosts in a group, in inventory order.
    pub fn in_group(&self, group: HostGroup) -> Vec<&Host> {
        self.hosts.iter().filter(|h| h.in_group(group)).collect()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVENTORY: &str = r#"
[[hosts]]
name = "master"
address = "10.0.0.10"
groups = ["control-plane"]

[[hosts]]
name = "worker-1"
address = "10.0.0.11"
user = "ubuntu"
port = 2222
sudo = true
groups = ["worker"]

[[hosts]]
name = "localhost"
connection = "local"
groups = ["worker"]
"#;

    #[test]
    fn test_load_applies_defaults() {
        let defaults = SshConfig {
            identity_file: Some("~/.ssh/cluster".into()),
            ..SshConfig::default()
        };
        let inv = Inventory::from_toml(INVENTORY, &defaults).unwrap();
        assert_eq!(inv.len(), 3);

        let master = inv.get("master").unwrap();
        assert_eq!(master.user, "root");
        assert_eq!(master.port, 22);
        assert_eq!(master.identity_file.as_deref(), Some("~/.ssh/cluster"));

        let w1 = inv.get("worker-1").unwrap();
        assert_eq!(w1.user, "ubuntu");
        assert_eq!(w1.port, 2222);
        assert!(w1.sudo);
        assert!(!master.sudo);

        let local = inv.get("localhost").unwrap();
        assert_eq!(local.address, "localhost");
        assert_eq!(local.connection, ConnectionKind::Local);
    }

    #[test]
    fn test_group_membership() {
        let inv = Inventory::from_toml(INVENTORY, &SshConfig::default()).unwrap();
        let names = |g| {
            inv.in_group(g)
                .iter()
                .map(|h| h.name.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(names(HostGroup::ControlPlane), vec!["master"]);
        assert_eq!(names(HostGroup::Worker), vec!["worker-1", "localhost"]);
        assert_eq!(names(HostGroup::All).len(), 3);
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let err = Inventory::new(vec![Host::new("a", "1.1.1.1"), Host::new("a", "1.1.1.2")])
            .unwrap_err();
        assert!(matches!(err, StrapError::DuplicateHost(name) if name == "a"));
    }

    #[test]
    fn test_host_builder_dedupes_groups() {
        let host = Host::new("m", "10.0.0.1")
            .with_group(HostGroup::ControlPlane)
            .with_group(HostGroup::ControlPlane);
        assert_eq!(host.groups, vec![HostGroup::ControlPlane]);
        assert!(host.in_group(HostGroup::All));
        assert!(!host.in_group(HostGroup::Worker));
    }
}
