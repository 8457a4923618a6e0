//! Modules: named, ordered groups of tasks
//!
//! `init` wires the task list against the runtime, `run` executes the tasks
//! in declared order and stops at the first failing task. A skipped module
//! runs nothing.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{PipeError, Result};
use crate::prepare::Prepare;
use crate::runtime::Runtime;
use crate::task::Task;

#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    fn is_skip(&self) -> bool {
        false
    }

    /// Build the task list; called once, right before `run`
    async fn init(&mut self, _runtime: &Runtime) -> Result<()> {
        Ok(())
    }

    async fn run(&self, runtime: &Runtime) -> Result<()>;

    /// Hooks run by the pipeline after this module, before pipeline-wide hooks
    fn post_hooks(&self) -> Vec<Arc<dyn PostHook>> {
        Vec::new()
    }
}

/// Called after a module finishes, with its error if it failed
#[async_trait]
pub trait PostHook: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn after(&self, runtime: &Runtime, module: &str, error: Option<&PipeError>) -> Result<()>;
}

type InitFn = Box<dyn Fn(&Runtime) -> Result<Vec<Task>> + Send + Sync>;

/// Module made of a task list, optionally repeated until a condition holds
pub struct TaskModule {
    name: String,
    desc: String,
    skip: bool,
    init_fn: Option<InitFn>,
    tasks: Vec<Task>,
    built: Vec<Task>,
    until: Option<(Arc<dyn Prepare>, u32)>,
    hooks: Vec<Arc<dyn PostHook>>,
}

impl TaskModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            skip: false,
            init_fn: None,
            tasks: Vec::new(),
            built: Vec::new(),
            until: None,
            hooks: Vec::new(),
        }
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Append a fixed task
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Build the tasks at init time from the runtime (host sets, cache values)
    ///
    /// Tasks returned by `f` run after any fixed tasks and are rebuilt on
    /// every `init`.
    pub fn init_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&Runtime) -> Result<Vec<Task>> + Send + Sync + 'static,
    {
        self.init_fn = Some(Box::new(f));
        self
    }

    /// Re-run the task list until `done` passes, at most `max_rounds` times
    pub fn until(mut self, done: impl Prepare + 'static, max_rounds: u32) -> Self {
        self.until = Some((Arc::new(done), max_rounds.max(1)));
        self
    }

    pub fn post_hook(mut self, hook: impl PostHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Fixed tasks followed by the ones built at the last `init`
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().chain(self.built.iter())
    }

    async fn run_tasks(&self, runtime: &Runtime) -> Result<()> {
        for task in self.tasks() {
            task.execute(runtime).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for TaskModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_skip(&self) -> bool {
        self.skip
    }

    async fn init(&mut self, runtime: &Runtime) -> Result<()> {
        if let Some(f) = &self.init_fn {
            self.built = f(runtime)?;
            debug!(module = %self.name, tasks = self.built.len(), "module initialized");
        }
        Ok(())
    }

    async fn run(&self, runtime: &Runtime) -> Result<()> {
        if self.skip {
            return Ok(());
        }
        if !self.desc.is_empty() {
            info!(module = %self.name, "{}", self.desc);
        }

        let Some((done, max_rounds)) = &self.until else {
            return self.run_tasks(runtime).await;
        };

        for round in 1..=*max_rounds {
            self.run_tasks(runtime).await?;
            if done.pre_check(runtime).await? {
                debug!(module = %self.name, round, "until condition met");
                return Ok(());
            }
            info!(module = %self.name, round, max_rounds, "until condition not met, repeating");
        }
        Err(PipeError::UntilExhausted {
            module: self.name.clone(),
            rounds: *max_rounds,
        })
    }

    fn post_hooks(&self) -> Vec<Arc<dyn PostHook>> {
        self.hooks.clone()
    }
}

impl fmt::Debug for TaskModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskModule")
            .field("name", &self.name)
            .field("skip", &self.skip)
            .field("tasks", &self.tasks().collect::<Vec<_>>())
            .field("until", &self.until.as_ref().map(|(_, n)| *n))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::action_fn;
    use crate::connector::MockConnector;
    use crate::host::Host;
    use crate::prepare::FnPrepare;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::builder("test")
            .host(Host::new("n1", "10.0.0.1").with_role("master"))
            .host(Host::new("n2", "10.0.0.2").with_role("worker"))
            .connector(Arc::new(MockConnector::new()))
            .without_dirs()
            .build()
            .unwrap()
    }

    fn counting_task(name: &str, counter: &Arc<AtomicU32>, hosts: Vec<Host>) -> Task {
        let c = Arc::clone(counter);
        Task::remote(
            name,
            action_fn(name.to_string(), move |_rt: Runtime| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .hosts(hosts)
        .retry(1)
    }

    #[tokio::test]
    async fn test_skip_runs_nothing() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let module = TaskModule::new("skipped")
            .skip(true)
            .task(counting_task("t", &counter, rt.all_hosts()));

        module.run(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_builds_tasks_from_runtime() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let mut module = TaskModule::new("workers").init_with(move |rt| {
            Ok(vec![counting_task("on-workers", &c, rt.hosts_by_role("worker"))])
        });

        module.init(&rt).await.unwrap();
        assert_eq!(module.tasks().count(), 1);
        module.run(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reinit_rebuilds_instead_of_appending() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let mut module = TaskModule::new("workers")
            .task(counting_task("fixed", &counter, rt.hosts_by_role("master")))
            .init_with(move |rt| Ok(vec![counting_task("built", &c, rt.hosts_by_role("worker"))]));

        for _ in 0..2 {
            module.init(&rt).await.unwrap();
            assert_eq!(module.tasks().count(), 2);
            module.run(&rt).await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fail_fast_across_tasks() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let failing = Task::remote(
            "fails",
            action_fn("fails", |_rt: Runtime| async { Err(PipeError::action("broken")) }),
        )
        .hosts(rt.all_hosts())
        .retry(1);

        let module = TaskModule::new("m")
            .task(failing)
            .task(counting_task("after", &counter, rt.all_hosts()));

        assert!(module.run(&rt).await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ignored_task_failure_continues() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let failing = Task::remote(
            "fails",
            action_fn("fails", |_rt: Runtime| async { Err(PipeError::action("broken")) }),
        )
        .hosts(rt.all_hosts())
        .retry(1)
        .ignore_error(true);

        let module = TaskModule::new("m")
            .task(failing)
            .task(counting_task("after", &counter, rt.all_hosts()));

        module.run(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_until_repeats_then_converges() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let done = FnPrepare::new("three-runs", move |_rt: &Runtime| {
            Ok(c.load(Ordering::SeqCst) >= 3)
        });

        let host = rt.hosts_by_role("master");
        let module = TaskModule::new("progressive")
            .task(counting_task("step", &counter, host))
            .until(done, 5);

        module.run(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_until_exhausted() {
        let rt = runtime();
        let counter = Arc::new(AtomicU32::new(0));
        let module = TaskModule::new("never")
            .task(
                counting_task("step", &counter, rt.hosts_by_role("master"))
                    .delay(Duration::from_millis(1)),
            )
            .until(FnPrepare::new("never", |_rt: &Runtime| Ok(false)), 2);

        let err = module.run(&rt).await.unwrap_err();
        assert!(matches!(err, PipeError::UntilExhausted { rounds: 2, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
