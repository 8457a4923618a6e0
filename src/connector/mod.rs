//! Host connections
//!
//! A [`Connection`] is "a machine we can run commands on and copy files
//! to/from". The [`Dialer`] memoizes one connection per host name.
//!
//! Backends:
//! - [`LocalConnection`]: `/bin/sh` + `tokio::fs` on this machine
//! - [`SshConnection`]: system `ssh`/`scp` binaries
//! - [`MockConnection`]: in-memory, records every call (tests)

mod dialer;
mod local;
mod mock;
mod ssh;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::host::Host;

pub use dialer::Dialer;
pub use local::LocalConnection;
pub use mock::{MockCall, MockConnection, MockConnector};
pub use ssh::{SshConnection, SshOptions};

// ============================================================================
// COMMAND OUTPUT
// ============================================================================

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status; -1 when the process was killed by a signal
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn from_process(out: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_code: out.status.code().unwrap_or(-1),
        }
    }
}

// ============================================================================
// CONNECTION TRAIT (ASYNC)
// ============================================================================

/// A live session with one host
///
/// Only `exec`, `copy` and `fetch` are required. The filesystem helpers
/// default to shell commands run through `exec`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the host this connection talks to
    fn host_name(&self) -> &str;

    /// Run a shell command; a nonzero exit is not an error at this level
    async fn exec(&self, cmd: &str) -> Result<CommandOutput>;

    /// Upload a local file to `remote`
    async fn copy(&self, local: &Path, remote: &str) -> Result<()>;

    /// Download `remote` into a local file
    async fn fetch(&self, remote: &str, local: &Path) -> Result<()>;

    async fn file_exists(&self, remote: &str) -> Result<bool> {
        let out = self.exec(&format!("test -f {}", shell_quote(remote))).await?;
        Ok(out.success())
    }

    async fn dir_exists(&self, remote: &str) -> Result<bool> {
        let out = self.exec(&format!("test -d {}", shell_quote(remote))).await?;
        Ok(out.success())
    }

    async fn mkdir_all(&self, remote: &str) -> Result<()> {
        self.exec_checked(&format!("mkdir -p {}", shell_quote(remote)))
            .await
            .map(|_| ())
    }

    async fn chmod(&self, remote: &str, mode: u32) -> Result<()> {
        self.exec_checked(&format!("chmod {:o} {}", mode, shell_quote(remote)))
            .await
            .map(|_| ())
    }

    /// Release the session; further calls may fail
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// `exec` that turns a nonzero exit into `CommandFailed`
    async fn exec_checked(&self, cmd: &str) -> Result<CommandOutput> {
        let out = self.exec(cmd).await?;
        if out.success() {
            Ok(out)
        } else {
            Err(crate::error::PipeError::CommandFailed {
                host: self.host_name().to_string(),
                command: cmd.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Opens connections; the [`Dialer`] sits in front of one of these
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>>;
}

/// Default connector: local shell for loopback hosts, ssh otherwise
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    options: SshOptions,
}

impl DefaultConnector {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, host: &Host) -> Result<Arc<dyn Connection>> {
        if host.is_local() {
            return Ok(Arc::new(LocalConnection::new(host.name())));
        }
        let conn = SshConnection::connect(host, self.options.clone()).await?;
        Ok(Arc::new(conn))
    }
}

/// Quote a string for POSIX shells
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
