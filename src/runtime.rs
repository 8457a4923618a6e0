//! Runtime: the host registry and shared state of one orchestration run
//!
//! A [`Runtime`] is cheap to clone. The shared part (hosts, dialer, work
//! dir, pipeline cache, event log) sits behind one `Arc`; each per-host
//! execution gets its own clone with a bound [`Runner`], so nothing at the
//! runtime level is mutated concurrently except through its own locks.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::connector::{Connection, Connector, DefaultConnector, Dialer};
use crate::error::{PipeError, Result};
use crate::event_log::EventLog;
use crate::host::Host;
use crate::inventory::Inventory;
use crate::runner::Runner;

pub const LOGS_DIR: &str = "logs";

struct Shared {
    name: String,
    hosts: Vec<Host>,
    dialer: Dialer,
    work_dir: PathBuf,
    pipeline_cache: Cache,
    deprecated: RwLock<HashSet<String>>,
    cancel: CancellationToken,
    events: EventLog,
}

/// One orchestration run, or a per-host view of it
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
    runner: Option<Runner>,
    module_cache: Cache,
}

impl Runtime {
    pub fn builder(name: impl Into<String>) -> RuntimeBuilder {
        RuntimeBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    // ═══════════════════════════════════════════
    // HOSTS
    // ═══════════════════════════════════════════

    /// All live hosts, in inventory order
    pub fn all_hosts(&self) -> Vec<Host> {
        let deprecated = self.shared.deprecated.read();
        self.shared
            .hosts
            .iter()
            .filter(|h| !deprecated.contains(h.name()))
            .cloned()
            .collect()
    }

    /// Live hosts carrying `role`, in inventory order (empty if none)
    pub fn hosts_by_role(&self, role: &str) -> Vec<Host> {
        let deprecated = self.shared.deprecated.read();
        self.shared
            .hosts
            .iter()
            .filter(|h| h.has_role(role) && !deprecated.contains(h.name()))
            .cloned()
            .collect()
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.shared.hosts.iter().find(|h| h.name() == name)
    }

    /// The host bound to this view, if any
    pub fn remote_host(&self) -> Option<&Host> {
        self.runner.as_ref().map(Runner::host)
    }

    /// Drop a host from the rest of the run (e.g. after it became unreachable)
    pub fn delete_host(&self, name: &str) {
        if self.shared.deprecated.write().insert(name.to_string()) {
            warn!(host = %name, "host removed from run");
        }
    }

    pub fn host_is_deprecated(&self, name: &str) -> bool {
        self.shared.deprecated.read().contains(name)
    }

    // ═══════════════════════════════════════════
    // CONNECTIONS
    // ═══════════════════════════════════════════

    pub fn runner(&self) -> Result<&Runner> {
        self.runner.as_ref().ok_or_else(|| PipeError::NoConnection {
            host: "<unbound>".to_string(),
        })
    }

    /// Memoized connection for `host`
    pub async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        self.shared.dialer.connect(host).await
    }

    pub fn dialer(&self) -> &Dialer {
        &self.shared.dialer
    }

    /// Close every open connection
    pub async fn close(&self) {
        self.shared.dialer.close_all().await;
    }

    /// Shallow copy with no host bound
    pub fn copy(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            runner: None,
            module_cache: self.module_cache.clone(),
        }
    }

    /// Per-host view with `runner` bound
    pub fn with_runner(&self, runner: Runner) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            runner: Some(runner),
            module_cache: self.module_cache.clone(),
        }
    }

    /// View with a fresh module-scoped cache
    pub fn with_module_cache(&self, cache: Cache) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            runner: self.runner.clone(),
            module_cache: cache,
        }
    }

    // ═══════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════

    pub fn work_dir(&self) -> &Path {
        &self.shared.work_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.shared.work_dir.join(LOGS_DIR)
    }

    pub fn host_work_dir(&self, host_name: &str) -> PathBuf {
        self.shared.work_dir.join(host_name)
    }

    /// Cache shared by every task of the run
    pub fn pipeline_cache(&self) -> &Cache {
        &self.shared.pipeline_cache
    }

    /// Cache scoped to the module currently running
    pub fn module_cache(&self) -> &Cache {
        &self.module_cache
    }

    /// Cache of the bound host
    pub fn host_cache(&self) -> Option<&Cache> {
        self.remote_host().map(Host::cache)
    }

    pub fn events(&self) -> &EventLog {
        &self.shared.events
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.shared.cancel
    }

    /// Ask in-flight tasks to stop dispatching hosts
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("name", &self.shared.name)
            .field("hosts", &self.shared.hosts.len())
            .field("work_dir", &self.shared.work_dir)
            .field("runner", &self.runner)
            .finish()
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builds a [`Runtime`] once, before the pipeline starts
pub struct RuntimeBuilder {
    name: String,
    hosts: Vec<Host>,
    connector: Option<Arc<dyn Connector>>,
    work_dir: PathBuf,
    events: EventLog,
    create_dirs: bool,
}

impl RuntimeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hosts: Vec::new(),
            connector: None,
            work_dir: PathBuf::from(crate::config::DEFAULT_WORK_DIR),
            events: EventLog::new(),
            create_dirs: true,
        }
    }

    pub fn hosts(mut self, hosts: Vec<Host>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn host(mut self, host: Host) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn inventory(self, inventory: Inventory) -> Self {
        self.hosts(inventory.into_hosts())
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Skip creating the work directory tree (in-memory tests)
    pub fn without_dirs(mut self) -> Self {
        self.create_dirs = false;
        self
    }

    pub fn build(self) -> Result<Runtime> {
        let mut seen = HashSet::new();
        for h in &self.hosts {
            if !seen.insert(h.name().to_string()) {
                return Err(PipeError::DuplicateHost {
                    host: h.name().to_string(),
                });
            }
        }

        if self.create_dirs {
            std::fs::create_dir_all(self.work_dir.join(LOGS_DIR))?;
            for h in &self.hosts {
                std::fs::create_dir_all(self.work_dir.join(h.name()))?;
            }
        }

        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(DefaultConnector::default()));

        info!(
            runtime = %self.name,
            hosts = self.hosts.len(),
            work_dir = %self.work_dir.display(),
            "runtime ready"
        );

        Ok(Runtime {
            shared: Arc::new(Shared {
                name: self.name,
                hosts: self.hosts,
                dialer: Dialer::new(connector),
                work_dir: self.work_dir,
                pipeline_cache: Cache::new(),
                deprecated: RwLock::new(HashSet::new()),
                cancel: CancellationToken::new(),
                events: self.events,
            }),
            runner: None,
            module_cache: Cache::new(),
        })
    }
}
