//! Mock connections for testing
//!
//! Nothing touches the network or the filesystem. Every command and transfer
//! is recorded so tests can assert on what actions did.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{CommandOutput, Connection, Connector};
use crate::error::{PipeError, Result};
use crate::host::Host;

/// One recorded call against a mock host
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Exec(String),
    Copy { local: String, remote: String },
    Fetch { remote: String, local: String },
    Close,
}

#[derive(Default)]
struct MockState {
    dials: HashMap<String, usize>,
    calls: Vec<(String, MockCall)>,
    /// (host or "*", command substring) -> scripted output
    responses: Vec<(String, String, CommandOutput)>,
    unreachable: HashSet<String>,
    files: HashSet<(String, String)>,
    exec_delay: Option<Duration>,
    connect_delay: Option<Duration>,
}

/// Connector that produces [`MockConnection`]s sharing one recorder
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make dialing `host` fail with a connection error
    pub fn unreachable(self, host: impl Into<String>) -> Self {
        self.state.lock().unreachable.insert(host.into());
        self
    }

    /// Script the output of commands containing `pattern` on any host
    pub fn respond(self, pattern: impl Into<String>, output: CommandOutput) -> Self {
        self.respond_on("*", pattern, output)
    }

    /// Script the output of commands containing `pattern` on one host
    pub fn respond_on(
        self,
        host: impl Into<String>,
        pattern: impl Into<String>,
        output: CommandOutput,
    ) -> Self {
        self.state
            .lock()
            .responses
            .push((host.into(), pattern.into(), output));
        self
    }

    /// Delay every exec (for timeout tests)
    pub fn with_exec_delay(self, delay: Duration) -> Self {
        self.state.lock().exec_delay = Some(delay);
        self
    }

    /// Delay every dial (for stuck-handshake tests)
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = Some(delay);
        self
    }

    /// Pretend `path` exists on `host`
    pub fn with_file(self, host: impl Into<String>, path: impl Into<String>) -> Self {
        self.state.lock().files.insert((host.into(), path.into()));
        self
    }

    pub fn dial_count(&self, host: &str) -> usize {
        self.state.lock().dials.get(host).copied().unwrap_or(0)
    }

    /// All calls made against `host`, in order
    pub fn calls(&self, host: &str) -> Vec<MockCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Commands executed on `host`, in order
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.calls(host)
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Exec(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// Hosts in the order they first ran a command
    pub fn exec_order(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        state
            .calls
            .iter()
            .filter(|(_, c)| matches!(c, MockCall::Exec(_)))
            .filter(|(h, _)| seen.insert(h.clone()))
            .map(|(h, _)| h.clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.unreachable.contains(host.name()) {
            return Err(PipeError::Connection {
                host: host.name().to_string(),
                reason: "connection refused (mock)".to_string(),
            });
        }
        *state.dials.entry(host.name().to_string()).or_insert(0) += 1;
        Ok(Arc::new(MockConnection {
            host: host.name().to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// In-memory connection handed out by [`MockConnector`]
pub struct MockConnection {
    host: String,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    fn record(&self, call: MockCall) {
        self.state.lock().calls.push((self.host.clone(), call));
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn host_name(&self) -> &str {
        &self.host
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        self.record(MockCall::Exec(cmd.to_string()));
        let delay = self.state.lock().exec_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        // Host-specific responses win over wildcard ones
        let scripted = state
            .responses
            .iter()
            .filter(|(h, p, _)| h == &self.host && cmd.contains(p.as_str()))
            .chain(
                state
                    .responses
                    .iter()
                    .filter(|(h, p, _)| h == "*" && cmd.contains(p.as_str())),
            )
            .map(|(_, _, out)| out.clone())
            .next();
        Ok(scripted.unwrap_or_default())
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        self.record(MockCall::Copy {
            local: local.display().to_string(),
            remote: remote.to_string(),
        });
        self.state
            .lock()
            .files
            .insert((self.host.clone(), remote.to_string()));
        Ok(())
    }

    async fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        self.record(MockCall::Fetch {
            remote: remote.to_string(),
            local: local.display().to_string(),
        });
        if !self.file_exists(remote).await? {
            return Err(PipeError::Transfer {
                host: self.host.clone(),
                reason: format!("{}: no such file (mock)", remote),
            });
        }
        Ok(())
    }

    async fn file_exists(&self, remote: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .files
            .contains(&(self.host.clone(), remote.to_string())))
    }

    async fn close(&self) -> Result<()> {
        self.record(MockCall::Close);
        Ok(())
    }
}
