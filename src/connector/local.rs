//! Connection to the machine the engine runs on

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{CommandOutput, Connection};
use crate::error::{PipeError, Result};

/// Runs commands through `/bin/sh -c` and copies with `tokio::fs`
#[derive(Debug, Clone)]
pub struct LocalConnection {
    host: String,
}

impl LocalConnection {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::copy(from, to)
            .await
            .map_err(|e| PipeError::Transfer {
                host: self.host.clone(),
                reason: format!("{} -> {}: {}", from.display(), to.display(), e),
            })?;
        Ok(())
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn host_name(&self) -> &str {
        &self.host
    }

    async fn exec(&self, cmd: &str) -> Result<CommandOutput> {
        debug!(host = %self.host, cmd, "exec (local)");
        // kill_on_drop: a timed-out attempt must not leave the child running
        let out = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipeError::Connection {
                host: self.host.clone(),
                reason: format!("failed to spawn shell: {}", e),
            })?;
        Ok(CommandOutput::from_process(out))
    }

    async fn copy(&self, local: &Path, remote: &str) -> Result<()> {
        self.copy_file(local, Path::new(remote)).await
    }

    async fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        self.copy_file(Path::new(remote), local).await
    }

    async fn file_exists(&self, remote: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(remote)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn dir_exists(&self, remote: &str) -> Result<bool> {
        Ok(tokio::fs::metadata(remote)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn mkdir_all(&self, remote: &str) -> Result<()> {
        tokio::fs::create_dir_all(remote).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let conn = LocalConnection::new("localhost");
        let out = conn.exec("echo hello; echo oops >&2; exit 3").await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, 3);
    }

    #[tokio::test]
    async fn test_copy_fetch_and_fs_helpers() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        std::fs::write(&src, "payload").unwrap();

        let conn = LocalConnection::new("localhost");
        let remote_dir = dir.path().join("remote/nested");
        let remote = remote_dir.join("dst.txt");
        let remote_str = remote.to_str().unwrap();

        conn.copy(&src, remote_str).await.unwrap();
        assert!(conn.file_exists(remote_str).await.unwrap());
        assert!(conn.dir_exists(remote_dir.to_str().unwrap()).await.unwrap());
        assert!(!conn.file_exists(remote_dir.to_str().unwrap()).await.unwrap());

        let back = dir.path().join("back.txt");
        conn.fetch(remote_str, &back).await.unwrap();
        assert_eq!(std::fs::read_to_string(back).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_exec_checked_fails_on_nonzero() {
        let conn = LocalConnection::new("localhost");
        let err = conn.exec_checked("exit 1").await.unwrap_err();
        assert!(matches!(err, PipeError::CommandFailed { exit_code: 1, .. }));
    }
}
