//! Preconditions evaluated per host before a task's action runs
//!
//! `Ok(false)` means "skip this host", not an error. `Err(_)` means the check
//! itself failed; the task retries it and fails the host if it keeps failing.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::Cache;
use crate::error::Result;
use crate::runtime::Runtime;

#[async_trait]
pub trait Prepare: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool>;
}

/// Logical AND of several prepares, left to right, short-circuiting
#[derive(Clone, Default)]
pub struct PrepareCollection {
    prepares: Vec<Arc<dyn Prepare>>,
}

impl PrepareCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, prepare: impl Prepare + 'static) -> Self {
        self.prepares.push(Arc::new(prepare));
        self
    }

    pub fn push(&mut self, prepare: Arc<dyn Prepare>) {
        self.prepares.push(prepare);
    }

    pub fn len(&self) -> usize {
        self.prepares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prepares.is_empty()
    }
}

#[async_trait]
impl Prepare for PrepareCollection {
    fn name(&self) -> &str {
        "PrepareCollection"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        for p in &self.prepares {
            if !p.pre_check(runtime).await? {
                tracing::debug!(prepare = p.name(), "precondition not met");
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// BUILT-IN PREDICATES
// ============================================================================

/// Always passes; the default when a task has no prepare
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

#[async_trait]
impl Prepare for Always {
    fn name(&self) -> &str {
        "Always"
    }

    async fn pre_check(&self, _runtime: &Runtime) -> Result<bool> {
        Ok(true)
    }
}

/// Passes when the bound host carries `role`
#[derive(Debug, Clone)]
pub struct HasRole(pub String);

impl HasRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }
}

#[async_trait]
impl Prepare for HasRole {
    fn name(&self) -> &str {
        "HasRole"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        Ok(runtime.remote_host().is_some_and(|h| h.has_role(&self.0)))
    }
}

/// Passes only on the first live host of `role` (e.g. the first etcd node)
#[derive(Debug, Clone)]
pub struct FirstOfRole(pub String);

impl FirstOfRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }
}

#[async_trait]
impl Prepare for FirstOfRole {
    fn name(&self) -> &str {
        "FirstOfRole"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        let Some(host) = runtime.remote_host() else {
            return Ok(false);
        };
        Ok(runtime
            .hosts_by_role(&self.0)
            .first()
            .is_some_and(|first| first.name() == host.name()))
    }
}

/// Which cache a cache predicate looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheScope {
    #[default]
    Pipeline,
    Module,
    Host,
}

impl CacheScope {
    fn resolve(self, runtime: &Runtime) -> Option<&Cache> {
        match self {
            CacheScope::Pipeline => Some(runtime.pipeline_cache()),
            CacheScope::Module => Some(runtime.module_cache()),
            CacheScope::Host => runtime.host_cache(),
        }
    }
}

/// Passes when `key` is present in the chosen cache
#[derive(Debug, Clone)]
pub struct CacheKeyPresent {
    pub key: String,
    pub scope: CacheScope,
}

impl CacheKeyPresent {
    pub fn new(key: impl Into<String>, scope: CacheScope) -> Self {
        Self {
            key: key.into(),
            scope,
        }
    }
}

#[async_trait]
impl Prepare for CacheKeyPresent {
    fn name(&self) -> &str {
        "CacheKeyPresent"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        Ok(self
            .scope
            .resolve(runtime)
            .is_some_and(|c| c.contains_key(&self.key)))
    }
}

/// Passes when `key` is absent from the chosen cache
#[derive(Debug, Clone)]
pub struct CacheKeyAbsent {
    pub key: String,
    pub scope: CacheScope,
}

impl CacheKeyAbsent {
    pub fn new(key: impl Into<String>, scope: CacheScope) -> Self {
        Self {
            key: key.into(),
            scope,
        }
    }
}

#[async_trait]
impl Prepare for CacheKeyAbsent {
    fn name(&self) -> &str {
        "CacheKeyAbsent"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        Ok(!self
            .scope
            .resolve(runtime)
            .is_some_and(|c| c.contains_key(&self.key)))
    }
}

/// Inverts another prepare; errors pass through unchanged
pub struct Not<P>(pub P);

#[async_trait]
impl<P: Prepare> Prepare for Not<P> {
    fn name(&self) -> &str {
        "Not"
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        Ok(!self.0.pre_check(runtime).await?)
    }
}

/// Prepare from a synchronous closure
pub struct FnPrepare<F> {
    name: String,
    f: F,
}

impl<F> FnPrepare<F>
where
    F: Fn(&Runtime) -> Result<bool> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> Prepare for FnPrepare<F>
where
    F: Fn(&Runtime) -> Result<bool> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_check(&self, runtime: &Runtime) -> Result<bool> {
        (self.f)(runtime)
    }
}
