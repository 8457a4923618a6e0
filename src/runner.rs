//! Command and file-transfer facade for the host bound to an execution
//!
//! Actions never talk to a [`Connection`] directly; they go through the
//! runner so output logging, sudo wrapping and the "no connection" check
//! live in one place.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::connector::{shell_quote, CommandOutput, Connection};
use crate::error::{PipeError, Result};
use crate::host::Host;

/// Staging directory for sudo copies
const TMP_DIR: &str = "/tmp/kubepipe";

/// Runner bound to one host for one task execution
#[derive(Clone)]
pub struct Runner {
    conn: Option<Arc<dyn Connection>>,
    host: Host,
    /// Position of the host in the task's host list
    index: usize,
}

impl Runner {
    pub fn new(conn: Option<Arc<dyn Connection>>, host: Host, index: usize) -> Self {
        Self { conn, host, index }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&self) -> Result<&Arc<dyn Connection>> {
        self.conn.as_ref().ok_or_else(|| PipeError::NoConnection {
            host: self.host.name().to_string(),
        })
    }

    // ═══════════════════════════════════════════
    // COMMANDS
    // ═══════════════════════════════════════════

    /// Run a command and return its raw output (nonzero exit is not an error)
    pub async fn exec(&self, cmd: &str, print_output: bool) -> Result<CommandOutput> {
        let out = self.conn()?.exec(cmd).await?;
        if print_output {
            for line in out.stdout.lines() {
                info!(host = %self.host.name(), "{}", line);
            }
        }
        debug!(host = %self.host.name(), cmd, exit_code = out.exit_code, "command finished");
        Ok(out)
    }

    /// Run a command, failing on a nonzero exit; returns trimmed stdout
    pub async fn cmd(&self, cmd: &str, print_output: bool) -> Result<String> {
        let out = self.exec(cmd, print_output).await?;
        if !out.success() {
            return Err(PipeError::CommandFailed {
                host: self.host.name().to_string(),
                command: cmd.to_string(),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout.trim().to_string())
    }

    pub async fn sudo_exec(&self, cmd: &str, print_output: bool) -> Result<CommandOutput> {
        self.exec(&sudo_prefix(cmd), print_output).await
    }

    pub async fn sudo_cmd(&self, cmd: &str, print_output: bool) -> Result<String> {
        self.cmd(&sudo_prefix(cmd), print_output).await
    }

    // ═══════════════════════════════════════════
    // FILES
    // ═══════════════════════════════════════════

    pub async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        debug!(host = %self.host.name(), local = %local.display(), remote, "copy");
        self.conn()?.copy(local, remote).await
    }

    /// Copy into a staging dir as the login user, then move into place as root
    pub async fn sudo_copy(&self, local: &Path, remote: &str) -> Result<()> {
        let file_name = Path::new(remote)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipeError::Transfer {
                host: self.host.name().to_string(),
                reason: format!("invalid remote path: {}", remote),
            })?;
        let staged = format!("{}/{}", TMP_DIR, file_name);

        self.cmd(&format!("mkdir -p {}", TMP_DIR), false).await?;
        self.copy(local, &staged).await?;

        let parent = Path::new(remote)
            .parent()
            .map(|p| p.display().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        self.sudo_cmd(
            &format!(
                "mkdir -p {} && mv -f {} {}",
                shell_quote(&parent),
                shell_quote(&staged),
                shell_quote(remote)
            ),
            false,
        )
        .await?;
        Ok(())
    }

    pub async fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        debug!(host = %self.host.name(), remote, local = %local.display(), "fetch");
        self.conn()?.fetch(remote, local).await
    }

    pub async fn file_exist(&self, remote: &str) -> Result<bool> {
        self.conn()?.file_exists(remote).await
    }

    pub async fn dir_exist(&self, remote: &str) -> Result<bool> {
        self.conn()?.dir_exists(remote).await
    }

    pub async fn mkdir(&self, remote: &str) -> Result<()> {
        self.conn()?.mkdir_all(remote).await
    }

    pub async fn chmod(&self, remote: &str, mode: u32) -> Result<()> {
        self.conn()?.chmod(remote, mode).await
    }

    /// md5 of a remote file (first field of `md5sum`)
    pub async fn file_md5(&self, remote: &str) -> Result<String> {
        let out = self
            .cmd(&format!("md5sum {}", shell_quote(remote)), false)
            .await?;
        out.split_whitespace()
            .next()
            .map(str::to_string)
            .ok_or_else(|| PipeError::CommandFailed {
                host: self.host.name().to_string(),
                command: format!("md5sum {}", remote),
                exit_code: 0,
                stderr: "empty output".to_string(),
            })
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("host", &self.host.name())
            .field("index", &self.index)
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

/// Wrap a command so it runs as root with the caller's environment
pub fn sudo_prefix(cmd: &str) -> String {
    format!("sudo -E /bin/bash -c {}", shell_quote(cmd))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Connector, MockCall, MockConnector};

    async fn mock_runner(connector: &MockConnector) -> Runner {
        let host = Host::new("node1", "10.0.0.1");
        let conn = connector.connect(&host).await.unwrap();
        Runner::new(Some(conn), host, 0)
    }

    #[tokio::test]
    async fn test_no_connection() {
        let runner = Runner::new(None, Host::new("node1", "10.0.0.1"), 0);
        let err = runner.cmd("true", false).await.unwrap_err();
        assert!(matches!(err, PipeError::NoConnection { .. }));
        assert!(runner.file_exist("/x").await.is_err());
    }

    #[tokio::test]
    async fn test_cmd_nonzero_is_error() {
        let connector = MockConnector::new().respond("false", CommandOutput::failed(1, "nope"));
        let runner = mock_runner(&connector).await;

        let out = runner.exec("false", false).await.unwrap();
        assert_eq!(out.exit_code, 1);

        let err = runner.cmd("false", false).await.unwrap_err();
        assert!(matches!(err, PipeError::CommandFailed { exit_code: 1, .. }));
    }

    #[tokio::test]
    async fn test_sudo_cmd_wraps() {
        let connector = MockConnector::new();
        let runner = mock_runner(&connector).await;
        runner.sudo_cmd("systemctl restart kubelet", false).await.unwrap();
        assert_eq!(
            connector.commands("node1"),
            vec!["sudo -E /bin/bash -c 'systemctl restart kubelet'"]
        );
    }

    #[tokio::test]
    async fn test_sudo_copy_stages_then_moves() {
        let connector = MockConnector::new();
        let runner = mock_runner(&connector).await;
        runner
            .sudo_copy(Path::new("/work/kubelet.conf"), "/etc/kubernetes/kubelet.conf")
            .await
            .unwrap();

        let calls = connector.calls("node1");
        assert_eq!(calls[0], MockCall::Exec("mkdir -p /tmp/kubepipe".to_string()));
        assert_eq!(
            calls[1],
            MockCall::Copy {
                local: "/work/kubelet.conf".to_string(),
                remote: "/tmp/kubepipe/kubelet.conf".to_string(),
            }
        );
        assert!(matches!(&calls[2], MockCall::Exec(c) if c.contains("mv -f")));
    }

    #[tokio::test]
    async fn test_file_md5() {
        let connector = MockConnector::new().respond(
            "md5sum",
            CommandOutput::ok("d41d8cd98f00b204e9800998ecf8427e  /opt/f\n"),
        );
        let runner = mock_runner(&connector).await;
        assert_eq!(
            runner.file_md5("/opt/f").await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }
}
