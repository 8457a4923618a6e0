//! Units of work run by tasks
//!
//! Domain code implements [`Action`]; the engine only needs the uniform
//! `execute(&Runtime)` shape. Remote actions reach their host through
//! `runtime.runner()`, local actions use the runtime as a whole.

use std::future::Future;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::runtime::Runtime;

#[async_trait]
pub trait Action: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn execute(&self, runtime: &Runtime) -> Result<()>;
}

// ============================================================================
// GENERIC ACTIONS
// ============================================================================

/// Run a shell command on the bound host
///
/// With `save_as`, trimmed stdout is stored in the host cache under that key.
#[derive(Debug, Clone)]
pub struct CommandAction {
    pub command: String,
    pub sudo: bool,
    pub print_output: bool,
    pub save_as: Option<String>,
}

impl CommandAction {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            sudo: false,
            print_output: false,
            save_as: None,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn print_output(mut self) -> Self {
        self.print_output = true;
        self
    }

    pub fn save_as(mut self, key: impl Into<String>) -> Self {
        self.save_as = Some(key.into());
        self
    }
}

#[async_trait]
impl Action for CommandAction {
    fn name(&self) -> &str {
        "CommandAction"
    }

    async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let runner = runtime.runner()?;
        let stdout = if self.sudo {
            runner.sudo_cmd(&self.command, self.print_output).await?
        } else {
            runner.cmd(&self.command, self.print_output).await?
        };
        if let Some(key) = &self.save_as {
            runner.host().cache().set(key.clone(), stdout);
        }
        Ok(())
    }
}

/// Create a directory (and parents) on the bound host
#[derive(Debug, Clone)]
pub struct MkdirAction {
    pub path: String,
    pub mode: Option<u32>,
}

impl MkdirAction {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[async_trait]
impl Action for MkdirAction {
    fn name(&self) -> &str {
        "MkdirAction"
    }

    async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let runner = runtime.runner()?;
        runner.mkdir(&self.path).await?;
        if let Some(mode) = self.mode {
            runner.chmod(&self.path, mode).await?;
        }
        Ok(())
    }
}

/// Copy a local file to the bound host (staged through /tmp when `sudo`)
#[derive(Debug, Clone)]
pub struct CopyAction {
    pub local: PathBuf,
    pub remote: String,
    pub sudo: bool,
}

impl CopyAction {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            sudo: false,
        }
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }
}

#[async_trait]
impl Action for CopyAction {
    fn name(&self) -> &str {
        "CopyAction"
    }

    async fn execute(&self, runtime: &Runtime) -> Result<()> {
        let runner = runtime.runner()?;
        if self.sudo {
            runner.sudo_copy(&self.local, &self.remote).await
        } else {
            runner.copy(&self.local, &self.remote).await
        }
    }
}

/// Action from an async closure
///
/// The closure receives an owned clone of the runtime view.
pub struct FnAction<F> {
    name: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(Runtime) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

/// Build an [`FnAction`] without boxing by hand
pub fn action_fn<F, Fut>(
    name: impl Into<String>,
    f: F,
) -> FnAction<impl Fn(Runtime) -> BoxFuture<'static, Result<()>> + Send + Sync>
where
    F: Fn(Runtime) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    FnAction::new(name, move |rt| -> BoxFuture<'static, Result<()>> { Box::pin(f(rt)) })
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(Runtime) -> BoxFuture<'static, Result<()>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, runtime: &Runtime) -> Result<()> {
        (self.f)(runtime.clone()).await
    }
}
