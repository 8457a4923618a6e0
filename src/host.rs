//! Managed hosts and their static connection settings

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;

/// Name of the synthetic host local tasks run against
pub const LOCAL_HOST: &str = "localhost";

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_ARCH: &str = "amd64";

/// Static host entry as written in an inventory file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostSpec {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub internal_address: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default = "default_arch")]
    pub arch: String,
    /// SSH connect timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_arch() -> String {
    DEFAULT_ARCH.to_string()
}

impl HostSpec {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            internal_address: None,
            port: DEFAULT_SSH_PORT,
            user: DEFAULT_USER.to_string(),
            password: None,
            private_key: None,
            private_key_path: None,
            arch: DEFAULT_ARCH.to_string(),
            timeout: None,
        }
    }
}

/// One managed machine
///
/// Roles are assigned during inventory grouping; the cache lives as long as
/// the host and is shared by every action that targets it.
#[derive(Clone)]
pub struct Host {
    spec: HostSpec,
    roles: BTreeSet<String>,
    cache: Cache,
}

impl Host {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::from_spec(HostSpec::new(name, address))
    }

    pub fn from_spec(spec: HostSpec) -> Self {
        Self {
            spec,
            roles: BTreeSet::new(),
            cache: Cache::new(),
        }
    }

    /// The pseudo-host used by local tasks
    pub fn local() -> Self {
        Self::new(LOCAL_HOST, "127.0.0.1")
    }

    /// Builder-style role assignment
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.add_role(role);
        self
    }

    pub fn add_role(&mut self, role: impl Into<String>) {
        self.roles.insert(role.into());
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn address(&self) -> &str {
        &self.spec.address
    }

    /// Internal address, falling back to the public one
    pub fn internal_address(&self) -> &str {
        self.spec
            .internal_address
            .as_deref()
            .unwrap_or(&self.spec.address)
    }

    pub fn port(&self) -> u16 {
        self.spec.port
    }

    pub fn user(&self) -> &str {
        &self.spec.user
    }

    pub fn arch(&self) -> &str {
        &self.spec.arch
    }

    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Host-scoped cache
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// True when the address points at this machine
    pub fn is_local(&self) -> bool {
        is_local_address(&self.spec.address)
    }
}

/// Check if an address refers to the local machine
pub fn is_local_address(address: &str) -> bool {
    matches!(address, "localhost" | "127.0.0.1" | "::1")
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.spec.name)
            .field("address", &self.spec.address)
            .field("roles", &self.roles)
            .finish()
    }
}
