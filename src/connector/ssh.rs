//! SSH transport built on the system `ssh` and `scp` binaries
//!
//! Non-interactive only: `BatchMode=yes` keeps a missing key from hanging on
//! a password prompt, and keepalives surface dead peers.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandOutput, Connection};
use crate::error::{PipeError, Result};
use crate::host::{Host, DEFAULT_SSH_PORT};

/// ssh exits with 255 when the session itself failed
const SSH_CONNECTION_EXIT: i32 = 255;

/// Client options shared by every host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SshOptions {
    pub connect_timeout_secs: u64,
    pub server_alive_interval_secs: u64,
    pub strict_host_key_checking: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            server_alive_interval_secs: 15,
            strict_host_key_checking: false,
        }
    }
}

/// One host reached over ssh
///
/// An inline private key lives in a private temp file owned by the
/// connection; it is deleted on `close` or drop.
#[derive(Debug)]
pub struct SshConnection {
    host: String,
    user: String,
    address: String,
    port: u16,
    identity_file: Option<PathBuf>,
    key_file: Mutex<Option<TempPath>>,
    options: SshOptions,
}

impl SshConnection {
    /// Resolve credentials and verify the host answers
    pub async fn connect(host: &Host, mut options: SshOptions) -> Result<Self> {
        let spec = host.spec();
        if let Some(secs) = spec.timeout {
            options.connect_timeout_secs = secs;
        }

        let mut key_file = None;
        let identity_file = match (&spec.private_key_path, &spec.private_key) {
            (Some(path), _) => Some(PathBuf::from(path)),
            (None, Some(key)) => {
                let written = write_inline_key(host.name(), key).await?;
                let path = written.to_path_buf();
                key_file = Some(written);
                Some(path)
            }
            (None, None) if spec.password.is_some() => {
                return Err(PipeError::Connection {
                    host: host.name().to_string(),
                    reason: "password authentication is not supported by the ssh transport; \
                             set privateKeyPath"
                        .to_string(),
                });
            }
            (None, None) => None,
        };

        let conn = Self {
            host: host.name().to_string(),
            user: spec.user.clone(),
            address: spec.address.clone(),
            port: spec.port,
            identity_file,
            key_file: Mutex::new(key_file),
            options,
        };

        // On failure `conn` drops here and takes the key file with it
        conn.exec("true").await?;
        debug!(host = %conn.host, address = %conn.address, "ssh session ready");
        Ok(conn)
    }

    fn common_opts(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        let strict = if self.options.strict_host_key_checking {
            "yes"
        } else {
            "no"
        };
        for opt in [
            "BatchMode=yes".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            format!("ServerAliveInterval={}", self.options.server_alive_interval_secs),
            "ServerAliveCountMax=3".to_string(),
            format!("StrictHostKeyChecking={}", strict),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        args
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.common_opts();
        if self.port != DEFAULT_SSH_PORT {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }
        args.push(format!("{}@{}", self.user, self.address));
        args.push(command.to_string());
        args
    }

    fn build_scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-q".to_string()];
        args.extend(self.common_opts());
        if self.port != DEFAULT_SSH_PORT {
            args.push("-P".to_string());
            args.push(self.port.to_string());
        }
        args.push(from);
        args.push(to);
        args
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.address, path)
    }

    async fn scp(&self, from: String, to: String) -> Result<()> {
        let out = Command::new("scp")
            .args(self.build_scp_args(from.clone(), to.clone()))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipeError::Transfer {
                host: self.host.clone(),
                reason: format!("failed to spawn scp: {}", e),
            })?;
        let out = CommandOutput::from_process(out);
        if !out.success() {
            return Err(PipeError::Transfer {
                host: self.host.clone(),
                reason: format!("{} -> {}: {}", from, to, out.stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host_name(&self) -> &str {
        &self.host
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, cmd, "exec (ssh)");
        let out = Command::new("ssh")
            .args(self.build_ssh_args(cmd))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipeError::Connection {
                host: self.host.clone(),
                reason: format!("failed to spawn ssh: {}", e),
            })?;
        let out = CommandOutput::from_process(out);

        if out.exit_code == SSH_CONNECTION_EXIT && is_connection_error(&out.stderr) {
            warn!(host = %self.host, stderr = %out.stderr.trim(), "ssh session failed");
            return Err(PipeError::Connection {
                host: self.host.clone(),
                reason: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        self.scp(local.display().to_string(), self.remote_spec(remote))
            .await
    }

    async fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.scp(self.remote_spec(remote), local.display().to_string())
            .await
    }

    async fn close(&self) -> Result<()> {
        let key_file = self.key_file.lock().take();
        if let Some(path) = key_file {
            path.close()?;
            debug!(host = %self.host, "inline key removed");
        }
        Ok(())
    }
}

/// Persist an inline private key so ssh can read it with `-i`
///
/// The file gets a random name and is created with mode 0600.
async fn write_inline_key(host: &str, key: &str) -> Result<TempPath> {
    let prefix = format!("kubepipe-{}-", host);
    let key = key.to_string();
    let path = tokio::task::spawn_blocking(move || -> std::io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".key")
            .tempfile()?;
        file.write_all(key.as_bytes())?;
        if !key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.as_file().sync_all()?;
        Ok(file.into_temp_path())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(path)
}

fn is_connection_error(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "could not resolve hostname",
        "permission denied",
        "host key verification failed",
        "broken pipe",
        "connection closed by",
    ]
    .iter()
    .any(|p| stderr.contains(p))
}
