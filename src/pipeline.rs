//! Pipeline: ordered modules against one runtime
//!
//! Each module that is not skipped gets a fresh module cache, is initialized,
//! then run. The first
//! module error stops the pipeline; earlier modules are not undone.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, instrument, warn};

use crate::cache::Cache;
use crate::error::{PipeError, Result};
use crate::event_log::EventKind;
use crate::module::{Module, PostHook};
use crate::runtime::Runtime;

pub struct Pipeline {
    name: String,
    modules: Vec<Box<dyn Module>>,
    post_hooks: Vec<Arc<dyn PostHook>>,
    close_connections: bool,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
            post_hooks: Vec::new(),
            close_connections: true,
        }
    }

    pub fn module(mut self, module: impl Module + 'static) -> Self {
        self.modules.push(Box::new(module));
        self
    }

    pub fn modules(mut self, modules: Vec<Box<dyn Module>>) -> Self {
        self.modules.extend(modules);
        self
    }

    /// Hook run after every module
    pub fn post_hook(mut self, hook: impl PostHook + 'static) -> Self {
        self.post_hooks.push(Arc::new(hook));
        self
    }

    /// Keep connections open after `start` returns (default: close them)
    pub fn keep_connections(mut self) -> Self {
        self.close_connections = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run every module in order, stopping at the first failure
    #[instrument(name = "pipeline", skip_all, fields(pipeline = %self.name))]
    pub async fn start(&mut self, runtime: &Runtime) -> Result<()> {
        let started = Instant::now();
        runtime.events().emit(EventKind::PipelineStarted {
            pipeline: self.name.as_str().into(),
            module_count: self.modules.len(),
        });
        info!(modules = self.modules.len(), "pipeline started");

        let outcome = self.run_modules(runtime).await;

        if self.close_connections {
            runtime.close().await;
        }

        match outcome {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                runtime.events().emit(EventKind::PipelineCompleted {
                    pipeline: self.name.as_str().into(),
                    duration_ms,
                });
                info!(duration_ms, "pipeline completed");
                Ok(())
            }
            Err((module, err)) => {
                runtime.events().emit(EventKind::PipelineFailed {
                    pipeline: self.name.as_str().into(),
                    error: err.to_string(),
                    failed_module: Some(module.as_str().into()),
                });
                error!(module = %module, error = %err, "pipeline failed");
                Err(err)
            }
        }
    }

    async fn run_modules(&mut self, runtime: &Runtime) -> std::result::Result<(), (String, PipeError)> {
        for module in self.modules.iter_mut() {
            let name = module.name().to_string();
            // Skipped modules are not initialized
            if module.is_skip() {
                info!(module = %name, "module skipped");
                runtime.events().emit(EventKind::ModuleSkipped {
                    module: name.as_str().into(),
                });
                continue;
            }

            let view = runtime.with_module_cache(Cache::new());
            if let Err(e) = module.init(&view).await {
                return Err((name.clone(), wrap(&name, e)));
            }

            let module_started = Instant::now();
            runtime.events().emit(EventKind::ModuleStarted {
                module: name.as_str().into(),
            });
            info!(module = %name, "module started");

            let result = module.run(&view).await;

            match &result {
                Ok(()) => {
                    runtime.events().emit(EventKind::ModuleCompleted {
                        module: name.as_str().into(),
                        duration_ms: module_started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    runtime.events().emit(EventKind::ModuleFailed {
                        module: name.as_str().into(),
                        error: e.to_string(),
                    });
                }
            }

            let hooks: Vec<Arc<dyn PostHook>> = module
                .post_hooks()
                .into_iter()
                .chain(self.post_hooks.iter().cloned())
                .collect();
            let hook_result = run_hooks(&hooks, &view, &name, result.as_ref().err()).await;

            match (result, hook_result) {
                (Err(e), hook) => {
                    if let Err(h) = hook {
                        warn!(module = %name, error = %h, "post-hook failed after module failure");
                    }
                    return Err((name.clone(), wrap(&name, e)));
                }
                (Ok(()), Err(h)) => return Err((name, h)),
                (Ok(()), Ok(())) => {}
            }
        }
        Ok(())
    }
}

/// Run every hook; the first hook error is returned after all have run
async fn run_hooks(
    hooks: &[Arc<dyn PostHook>],
    runtime: &Runtime,
    module: &str,
    error: Option<&PipeError>,
) -> Result<()> {
    let mut first_err = None;
    for hook in hooks {
        if let Err(e) = hook.after(runtime, module, error).await {
            warn!(module, hook = hook.name(), error = %e, "post-hook failed");
            if first_err.is_none() {
                first_err = Some(PipeError::HookFailed {
                    module: module.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn wrap(module: &str, err: PipeError) -> PipeError {
    PipeError::ModuleFailed {
        module: module.to_string(),
        source: Box::new(err),
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field(
                "modules",
                &self.modules.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("post_hooks", &self.post_hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::action_fn;
    use crate::connector::{MockCall, MockConnector};
    use crate::host::Host;
    use crate::module::TaskModule;
    use crate::task::Task;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn runtime(connector: MockConnector) -> Runtime {
        Runtime::builder("test")
            .host(Host::new("n1", "10.0.0.1").with_role("master"))
            .connector(Arc::new(connector))
            .without_dirs()
            .build()
            .unwrap()
    }

    fn counting_module(name: &str, counter: &Arc<AtomicU32>, rt: &Runtime) -> TaskModule {
        let c = Arc::clone(counter);
        TaskModule::new(name).task(
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
            .hosts(rt.all_hosts())
            .retry(1),
        )
    }

    struct RecordingHook(Arc<Mutex<Vec<(String, bool)>>>);

    #[async_trait]
    impl PostHook for RecordingHook {
        async fn after(&self, _rt: &Runtime, module: &str, error: Option<&PipeError>) -> Result<()> {
            self.0.lock().push((module.to_string(), error.is_some()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_modules_run_in_order_and_close() {
        let connector = MockConnector::new();
        let rt = runtime(connector.clone());
        let counter = Arc::new(AtomicU32::new(0));

        let mut pipeline = Pipeline::new("create")
            .module(counting_module("a", &counter, &rt))
            .module(counting_module("b", &counter, &rt));
        pipeline.start(&rt).await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(connector.calls("n1").last(), Some(&MockCall::Close));
        assert_eq!(rt.events().pipeline_events().len(), 2);
    }

    #[tokio::test]
    async fn test_first_failure_stops_pipeline() {
        let rt = runtime(MockConnector::new());
        let counter = Arc::new(AtomicU32::new(0));
        let failing = TaskModule::new("broken").task(
            Task::remote(
                "fail",
                action_fn("fail", |_rt: Runtime| async { Err(PipeError::action("no disk")) }),
            )
            .hosts(rt.all_hosts())
            .retry(1),
        );

        let mut pipeline = Pipeline::new("create")
            .module(failing)
            .module(counting_module("later", &counter, &rt));
        let err = pipeline.start(&rt).await.unwrap_err();

        assert!(matches!(err, PipeError::ModuleFailed { ref module, .. } if module == "broken"));
        assert!(err.to_string().contains("no disk"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skipped_module_emits_event() {
        let rt = runtime(MockConnector::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut pipeline = Pipeline::new("p")
            .module(counting_module("skipped", &counter, &rt).skip(true))
            .module(counting_module("runs", &counter, &rt));

        pipeline.start(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(rt
            .events()
            .events()
            .iter()
            .any(|e| e.kind == EventKind::ModuleSkipped { module: "skipped".into() }));
    }

    #[tokio::test]
    async fn test_post_hooks_see_outcome() {
        let rt = runtime(MockConnector::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicU32::new(0));
        let failing = TaskModule::new("bad")
            .task(
                Task::remote(
                    "fail",
                    action_fn("fail", |_rt: Runtime| async { Err(PipeError::action("x")) }),
                )
                .hosts(rt.all_hosts())
                .retry(1),
            )
            .post_hook(RecordingHook(Arc::clone(&seen)));

        let mut pipeline = Pipeline::new("p")
            .module(counting_module("good", &counter, &rt))
            .module(failing)
            .post_hook(RecordingHook(Arc::clone(&seen)));

        assert!(pipeline.start(&rt).await.is_err());
        assert_eq!(
            *seen.lock(),
            vec![
                ("good".to_string(), false),
                ("bad".to_string(), true),
                ("bad".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_module_cache_is_fresh_per_module() {
        let rt = runtime(MockConnector::new());
        let writer = TaskModule::new("writer").task(Task::local(
            "write",
            action_fn("write", |rt: Runtime| async move {
                rt.module_cache().set("scratch", 1_i64);
                Ok(())
            }),
        ));
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let reader = TaskModule::new("reader").task(Task::local(
            "read",
            action_fn("read", move |rt: Runtime| {
                let o = Arc::clone(&o);
                async move {
                    *o.lock() = Some(rt.module_cache().contains_key("scratch"));
                    Ok(())
                }
            }),
        ));

        let mut pipeline = Pipeline::new("p").module(writer).module(reader);
        pipeline.start(&rt).await.unwrap();
        assert_eq!(*observed.lock(), Some(false));
    }

    struct BrokenInit;

    #[async_trait]
    impl Module for BrokenInit {
        fn name(&self) -> &str {
            "broken-init"
        }

        fn is_skip(&self) -> bool {
            true
        }

        async fn init(&mut self, _runtime: &Runtime) -> Result<()> {
            Err(PipeError::action("init must not run"))
        }

        async fn run(&self, _runtime: &Runtime) -> Result<()> {
            Err(PipeError::action("run must not run"))
        }
    }

    #[tokio::test]
    async fn test_skipped_module_is_not_initialized() {
        let rt = runtime(MockConnector::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut pipeline = Pipeline::new("p")
            .module(BrokenInit)
            .module(counting_module("runs", &counter, &rt));

        pipeline.start(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_does_not_duplicate_built_tasks() {
        let rt = runtime(MockConnector::new());
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let module = TaskModule::new("built").init_with(move |rt| {
            let c = Arc::clone(&c);
            Ok(vec![Task::remote(
                "count",
                action_fn("count", move |_rt: Runtime| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .hosts(rt.all_hosts())])
        });

        let mut pipeline = Pipeline::new("p").module(module);
        pipeline.start(&rt).await.unwrap();
        pipeline.start(&rt).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
