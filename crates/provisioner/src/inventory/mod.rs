//! Builds the Ansible host inventory handed to configuration management.
//!
//! The inventory is regenerated in full on every run. Every map in it is
//! ordered, so the same role assignments always serialize to the same bytes
//! and two runs can be diffed.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use crate::address::InstanceAddress;

/// The part a host plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeRole {
    /// Control plane node
    Master,
    /// Worker node
    Worker,
}

impl NodeRole {
    /// The inventory group hosts of this role are placed in.
    pub fn group(&self) -> &'static str {
        match self {
            NodeRole::Master => "masters",
            NodeRole::Worker => "workers",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

impl FromStr for NodeRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" | "control-plane" => Ok(NodeRole::Master),
            "worker" => Ok(NodeRole::Worker),
            other => Err(anyhow::anyhow!("unknown node role {}", other)),
        }
    }
}

/// Where a host lands in the inventory and how to log into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleAssignment {
    /// The host's role
    pub role: NodeRole,
    /// Resolved addresses of the backing instance
    pub address: InstanceAddress,
    /// SSH login user
    pub ssh_user: String,
}

/// One host of a [`HostInventory`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryHost {
    /// Resolved addresses of the backing instance
    pub address: InstanceAddress,
    /// SSH login user
    pub ssh_user: String,
    /// `user@ip` of the host SSH has to jump through, for hosts that only
    /// have a private address
    pub jump_via: Option<String>,
}

/// A complete inventory: role group → host alias → host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostInventory {
    groups: BTreeMap<String, BTreeMap<String, InventoryHost>>,
    vars: BTreeMap<String, String>,
}

/// Errors raised while building an inventory.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    /// No hosts were given.
    #[error("inventory has no hosts")]
    Empty,
    /// A host has no address at all.
    #[error("host {0} has no address to connect to")]
    NoAddress(String),
}

#[derive(Serialize)]
struct Document<'a> {
    all: AllGroup<'a>,
}

#[derive(Serialize)]
struct AllGroup<'a> {
    #[serde(skip_serializing_if = "no_vars")]
    vars: &'a BTreeMap<String, String>,
    children: BTreeMap<&'a str, Group<'a>>,
}

#[derive(Serialize)]
struct Group<'a> {
    hosts: BTreeMap<&'a str, HostVars>,
}

#[derive(Serialize)]
struct HostVars {
    ansible_host: String,
    ansible_user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    internal_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    floating_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ansible_ssh_common_args: Option<String>,
}

fn no_vars(vars: &&BTreeMap<String, String>) -> bool {
    vars.is_empty()
}

impl HostInventory {
    /// Iterate over `(group, alias, host)` in serialization order.
    pub fn hosts(&self) -> impl Iterator<Item = (&str, &str, &InventoryHost)> {
        self.groups.iter().flat_map(|(group, hosts)| {
            hosts
                .iter()
                .map(move |(alias, host)| (group.as_str(), alias.as_str(), host))
        })
    }

    /// Look up a host by alias.
    pub fn host(&self, alias: &str) -> Option<&InventoryHost> {
        self.groups.values().find_map(|hosts| hosts.get(alias))
    }

    /// Group names present in the inventory.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Render the inventory as Ansible YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let children = self
            .groups
            .iter()
            .map(|(group, hosts)| {
                let hosts = hosts
                    .iter()
                    .map(|(alias, host)| (alias.as_str(), host_vars(host)))
                    .collect();
                (group.as_str(), Group { hosts })
            })
            .collect();
        serde_yaml::to_string(&Document {
            all: AllGroup {
                vars: &self.vars,
                children,
            },
        })
    }

    /// Write the inventory to `path`, creating parent directories and
    /// replacing any previous file.
    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let yaml = self.to_yaml()?;
        tokio::fs::write(path, yaml).await?;
        debug!(path = %path.display(), "Wrote inventory");
        Ok(())
    }
}

fn host_vars(host: &InventoryHost) -> HostVars {
    let address = &host.address;
    HostVars {
        ansible_host: address
            .connect_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default(),
        ansible_user: host.ssh_user.clone(),
        internal_ip: address.internal_ip.map(|ip| ip.to_string()),
        floating_ip: address.floating_ip.map(|ip| ip.to_string()),
        ansible_ssh_common_args: host
            .jump_via
            .as_ref()
            .map(|jump| format!("-o ProxyJump={}", jump)),
    }
}

/// Builds a [`HostInventory`] from role assignments.
#[derive(Clone, Debug, Default)]
pub struct InventoryBuilder {
    vars: BTreeMap<String, String>,
}

impl InventoryBuilder {
    /// A builder with no group-wide variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable that applies to every host.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Build the inventory for `assignments`, keyed by host alias.
    ///
    /// Hosts without a floating IP are reached through the first master (by
    /// alias) that has one.
    pub fn build(
        &self,
        assignments: &BTreeMap<String, RoleAssignment>,
    ) -> Result<HostInventory, InventoryError> {
        if assignments.is_empty() {
            return Err(InventoryError::Empty);
        }

        let jump_host = assignments
            .values()
            .filter(|a| a.role == NodeRole::Master)
            .find_map(|a| {
                a.address
                    .floating_ip
                    .map(|ip| format!("{}@{}", a.ssh_user, ip))
            });

        let mut groups: BTreeMap<String, BTreeMap<String, InventoryHost>> = BTreeMap::new();
        for (alias, assignment) in assignments {
            if assignment.address.connect_ip().is_none() {
                return Err(InventoryError::NoAddress(alias.clone()));
            }
            let jump_via = match assignment.address.floating_ip {
                Some(_) => None,
                None => jump_host.clone(),
            };
            groups
                .entry(assignment.role.group().to_owned())
                .or_default()
                .insert(
                    alias.clone(),
                    InventoryHost {
                        address: assignment.address.clone(),
                        ssh_user: assignment.ssh_user.clone(),
                        jump_via,
                    },
                );
        }

        Ok(HostInventory {
            groups,
            vars: self.vars.clone(),
        })
    }
}
