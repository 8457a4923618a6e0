//! Host inventory loading and role grouping
//!
//! Role groups map a role name to a list of host names or numeric range
//! patterns (`node[1:3]` expands to `node1`, `node2`, `node3`). Grouping
//! runs once at load time and returns an error for unknown hosts and empty
//! mandatory roles.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipeError, Result};
use crate::host::{Host, HostSpec};

pub const ROLE_ETCD: &str = "etcd";
pub const ROLE_MASTER: &str = "master";
pub const ROLE_CONTROL_PLANE: &str = "control-plane";
pub const ROLE_WORKER: &str = "worker";
pub const ROLE_REGISTRY: &str = "registry";

/// Precompiled range pattern: `prefix[start:end]`
static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<prefix>[^\[\]]*)\[(?P<start>\d+):(?P<end>\d+)\]$")
        .expect("Invalid range regex")
});

/// Who manages etcd for the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EtcdType {
    /// Deployed and managed by this tool (etcd role is mandatory)
    #[default]
    Kubekey,
    /// Managed by kubeadm as static pods
    Kubeadm,
    /// Pre-existing external cluster
    External,
}

/// Inventory document as written in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySpec {
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
    #[serde(default)]
    pub role_groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub etcd_type: EtcdType,
}

/// Grouped inventory: hosts in declaration order with their roles assigned
#[derive(Debug, Clone)]
pub struct Inventory {
    hosts: Vec<Host>,
    etcd_type: EtcdType,
}

impl Inventory {
    /// Load and group an inventory file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: InventorySpec = serde_yaml::from_str(yaml)?;
        Self::from_spec(spec)
    }

    /// Resolve role groups and validate mandatory roles
    pub fn from_spec(spec: InventorySpec) -> Result<Self> {
        let mut seen = HashSet::new();
        for h in &spec.hosts {
            if !seen.insert(h.name.as_str()) {
                return Err(PipeError::DuplicateHost {
                    host: h.name.clone(),
                });
            }
        }

        let mut hosts: Vec<Host> = spec.hosts.into_iter().map(Host::from_spec).collect();

        for (role, patterns) in &spec.role_groups {
            for name in resolve_role_members(patterns)? {
                let host = hosts
                    .iter_mut()
                    .find(|h| h.name() == name)
                    .ok_or_else(|| PipeError::UnknownHost {
                        host: name.clone(),
                        role: role.clone(),
                    })?;
                host.add_role(role.as_str());
                // control-plane is the newer name for master
                if role == ROLE_CONTROL_PLANE {
                    host.add_role(ROLE_MASTER);
                }
                debug!(host = %name, role = %role, "Assigned role");
            }
        }

        let inventory = Self {
            hosts,
            etcd_type: spec.etcd_type,
        };
        inventory.validate()?;
        Ok(inventory)
    }

    fn validate(&self) -> Result<()> {
        if self.hosts_by_role(ROLE_MASTER).next().is_none() {
            return Err(PipeError::EmptyRole {
                role: "master/control-plane".to_string(),
            });
        }
        if self.etcd_type == EtcdType::Kubekey && self.hosts_by_role(ROLE_ETCD).next().is_none() {
            return Err(PipeError::EmptyRole {
                role: ROLE_ETCD.to_string(),
            });
        }
        Ok(())
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Hosts carrying `role`, in inventory order
    pub fn hosts_by_role<'a>(&'a self, role: &'a str) -> impl Iterator<Item = &'a Host> + 'a {
        self.hosts.iter().filter(move |h| h.has_role(role))
    }

    pub fn etcd_type(&self) -> EtcdType {
        self.etcd_type
    }

    pub fn into_hosts(self) -> Vec<Host> {
        self.hosts
    }
}

/// Expand a role's member list, preserving declaration order
pub fn resolve_role_members(patterns: &[String]) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for pattern in patterns {
        out.extend(expand_host_pattern(pattern)?);
    }
    Ok(out)
}

/// Expand `prefix[start:end]` into `prefix{start}..=prefix{end}`
///
/// Names without range syntax are returned as-is.
pub fn expand_host_pattern(pattern: &str) -> Result<Vec<String>> {
    let pattern = pattern.trim();
    let looks_like_range = pattern.contains('[') && pattern.contains(']') && pattern.contains(':');
    if !looks_like_range {
        return Ok(vec![pattern.to_string()]);
    }

    let caps = RANGE_RE
        .captures(pattern)
        .ok_or_else(|| PipeError::InvalidRange {
            pattern: pattern.to_string(),
            reason: "expected prefix[start:end]".to_string(),
        })?;

    let parse = |s: &str| {
        s.parse::<u64>().map_err(|e| PipeError::InvalidRange {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    };
    let start = parse(&caps["start"])?;
    let end = parse(&caps["end"])?;
    if start > end {
        return Err(PipeError::InvalidRange {
            pattern: pattern.to_string(),
            reason: format!("start {} is greater than end {}", start, end),
        });
    }

    let prefix = &caps["prefix"];
    Ok((start..=end).map(|i| format!("{}{}", prefix, i)).collect())
}
