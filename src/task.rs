//! Task: one action fanned out over a set of hosts
//!
//! Per host: bind a connection, gate on the prepare, run the action, record
//! the ending. Connect, prepare and action are each retried up to `retry`
//! attempts with `delay` between them; every attempt of every stage is
//! bounded by `timeout`.
//!
//! Fan-out:
//! - sequential: hosts one at a time, in list order
//! - parallel: bounded by a semaphore, permits acquired before spawning so a
//!   worker never starts without a slot and always releases it on exit
//! - serial batches: N or N% of hosts per batch; a failed batch stops the rest

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::action::Action;
use crate::config::{EngineConfig, DEFAULT_CONCURRENCY, DEFAULT_DELAY, DEFAULT_RETRY, DEFAULT_TIMEOUT};
use crate::connector::{Connection, LocalConnection};
use crate::ending::{ResultStatus, TaskResult};
use crate::error::{PipeError, Result};
use crate::event_log::EventKind;
use crate::host::Host;
use crate::prepare::Prepare;
use crate::runner::Runner;
use crate::runtime::Runtime;

// ============================================================================
// SERIAL BATCHES
// ============================================================================

/// Rolling batch size: a host count or a percentage of the task's hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SerialRepr", into = "String")]
pub enum Serial {
    Count(usize),
    Percent(u8),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SerialRepr {
    Int(u64),
    Str(String),
}

impl TryFrom<SerialRepr> for Serial {
    type Error = PipeError;

    fn try_from(repr: SerialRepr) -> Result<Self> {
        match repr {
            SerialRepr::Int(n) => n.to_string().parse(),
            SerialRepr::Str(s) => s.parse(),
        }
    }
}

impl FromStr for Serial {
    type Err = PipeError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PipeError::InvalidSerial {
            value: s.to_string(),
        };
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u8 = pct.trim().parse().map_err(|_| invalid())?;
            if pct == 0 || pct > 100 {
                return Err(invalid());
            }
            return Ok(Serial::Percent(pct));
        }
        let n: usize = s.parse().map_err(|_| invalid())?;
        if n == 0 {
            return Err(invalid());
        }
        Ok(Serial::Count(n))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Serial::Count(n) => write!(f, "{}", n),
            Serial::Percent(p) => write!(f, "{}%", p),
        }
    }
}

impl From<Serial> for String {
    fn from(s: Serial) -> Self {
        s.to_string()
    }
}

impl Serial {
    /// Hosts per batch for `total` hosts (at least 1)
    pub fn batch_size(&self, total: usize) -> usize {
        let size = match *self {
            Serial::Count(n) => n,
            Serial::Percent(p) => total * usize::from(p) / 100,
        };
        size.clamp(1, total.max(1))
    }
}

// ============================================================================
// TASK
// ============================================================================

/// Where a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Once per host in the task's host list
    Remote,
    /// Exactly once, against the local machine
    Local,
}

/// One action over a set of hosts
pub struct Task {
    name: String,
    desc: String,
    mode: TaskMode,
    hosts: Vec<Host>,
    prepare: Option<Arc<dyn Prepare>>,
    action: Arc<dyn Action>,
    parallel: bool,
    retry: u32,
    delay: Duration,
    timeout: Duration,
    host_timeout: Option<Duration>,
    concurrency: f64,
    max_concurrency: usize,
    serial: Option<Serial>,
    ignore_error: bool,
}

impl Task {
    /// Task run on each of its hosts
    pub fn remote(name: impl Into<String>, action: impl Action + 'static) -> Self {
        Self::new(name, TaskMode::Remote, Arc::new(action))
    }

    /// Task run once on the local machine (single attempt by default)
    pub fn local(name: impl Into<String>, action: impl Action + 'static) -> Self {
        let mut task = Self::new(name, TaskMode::Local, Arc::new(action));
        task.retry = 1;
        task
    }

    fn new(name: impl Into<String>, mode: TaskMode, action: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            desc: String::new(),
            mode,
            hosts: Vec::new(),
            prepare: None,
            action,
            parallel: false,
            retry: DEFAULT_RETRY,
            delay: DEFAULT_DELAY,
            timeout: DEFAULT_TIMEOUT,
            host_timeout: None,
            concurrency: 1.0,
            max_concurrency: DEFAULT_CONCURRENCY,
            serial: None,
            ignore_error: false,
        }
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }

    pub fn hosts(mut self, hosts: Vec<Host>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn prepare(mut self, prepare: impl Prepare + 'static) -> Self {
        self.prepare = Some(Arc::new(prepare));
        self
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Attempts per stage (values below 1 are treated as 1)
    pub fn retry(mut self, retry: u32) -> Self {
        self.retry = retry.max(1);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Per-attempt timeout for connect, prepare and action
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overall limit for one host, across all stages and retries
    pub fn host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = Some(timeout);
        self
    }

    /// Fraction of hosts allowed in flight, in (0, 1]
    pub fn concurrency(mut self, fraction: f64) -> Self {
        self.concurrency = fraction;
        self
    }

    /// Hard ceiling on simultaneous workers
    pub fn max_concurrency(mut self, slots: usize) -> Self {
        self.max_concurrency = slots.max(1);
        self
    }

    pub fn serial(mut self, serial: Serial) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn ignore_error(mut self, ignore: bool) -> Self {
        self.ignore_error = ignore;
        self
    }

    /// Take retry, delay, timeout and concurrency ceiling from engine config
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        if self.mode == TaskMode::Remote {
            self.retry = config.retry.max(1);
        }
        self.delay = config.delay();
        self.timeout = config.timeout();
        self.max_concurrency = config.concurrency.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.desc
    }

    pub fn mode(&self) -> TaskMode {
        self.mode
    }

    pub fn is_ignore_error(&self) -> bool {
        self.ignore_error
    }

    /// Worker slots for `hosts` hosts
    fn slots(&self, hosts: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        let fraction = if self.concurrency > 0.0 && self.concurrency <= 1.0 {
            self.concurrency
        } else {
            1.0
        };
        let slots = (fraction * hosts as f64).round() as usize;
        slots.clamp(1, self.max_concurrency)
    }

    fn target_hosts(&self, runtime: &Runtime) -> Vec<Host> {
        match self.mode {
            TaskMode::Local => vec![Host::local()],
            TaskMode::Remote => self
                .hosts
                .iter()
                .filter(|h| {
                    let gone = runtime.host_is_deprecated(h.name());
                    if gone {
                        debug!(task = %self.name, host = %h.name(), "skipping removed host");
                    }
                    !gone
                })
                .cloned()
                .collect(),
        }
    }

    /// Run on every host and apply the failure policy
    ///
    /// Returns the combined error when any host failed, unless the task
    /// ignores errors.
    pub async fn execute(&self, runtime: &Runtime) -> Result<TaskResult> {
        let result = self.dispatch(runtime).await?;
        if let Some(err) = result.combined_error(&self.name) {
            if self.ignore_error {
                warn!(task = %self.name, error = %err, "ignoring task failure");
            } else {
                return Err(err);
            }
        }
        Ok(result)
    }

    /// Run on every host and return the per-host endings
    ///
    /// Only cancellation is reported as an error here; host failures are in
    /// the returned result.
    #[instrument(name = "task", skip_all, fields(task = %self.name))]
    pub async fn dispatch(&self, runtime: &Runtime) -> Result<TaskResult> {
        let hosts = self.target_hosts(runtime);
        let result = TaskResult::new(hosts.iter().map(Host::name));
        let started = Instant::now();

        runtime.events().emit(EventKind::TaskStarted {
            task: self.name.as_str().into(),
            hosts: hosts.iter().map(|h| Arc::from(h.name())).collect(),
        });
        info!(hosts = hosts.len(), parallel = self.parallel, desc = %self.desc, "task started");

        let worker = Arc::new(Worker {
            task: Arc::from(self.name.as_str()),
            prepare: self.prepare.clone(),
            action: Arc::clone(&self.action),
            retry: self.retry,
            delay: self.delay,
            timeout: self.timeout,
            host_timeout: self.host_timeout,
            local: self.mode == TaskMode::Local,
            result: result.clone(),
        });

        let indexed: Vec<(usize, Host)> = hosts.into_iter().enumerate().collect();
        let outcome = match self.serial {
            Some(serial) => self.run_serial(serial, &worker, runtime, &indexed).await,
            None => {
                run_batch(&worker, runtime, &indexed, self.slots(indexed.len())).await
            }
        };

        let status = result.status();
        runtime.events().emit(EventKind::TaskCompleted {
            task: self.name.as_str().into(),
            status: status.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
        });
        info!(
            %status,
            success = result.count(ResultStatus::Success),
            failed = result.count(ResultStatus::Failed),
            skipped = result.count(ResultStatus::Skipped),
            "task finished"
        );

        outcome.map(|_| result)
    }

    async fn run_serial(
        &self,
        serial: Serial,
        worker: &Arc<Worker>,
        runtime: &Runtime,
        hosts: &[(usize, Host)],
    ) -> Result<()> {
        let size = serial.batch_size(hosts.len());
        let batches: Vec<&[(usize, Host)]> = hosts.chunks(size).collect();
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            info!(batch = i + 1, total, hosts = batch.len(), "running batch");
            run_batch(worker, runtime, batch, self.slots(batch.len())).await?;

            let failed = batch
                .iter()
                .any(|(_, h)| worker.result.get(h.name()).is_some_and(|r| r.is_failed()));
            if failed && i + 1 < total {
                warn!(batch = i + 1, "batch failed, remaining batches not started");
                break;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("hosts", &self.hosts.len())
            .field("parallel", &self.parallel)
            .field("retry", &self.retry)
            .field("serial", &self.serial)
            .field("ignore_error", &self.ignore_error)
            .finish()
    }
}

/// Dispatch `hosts` with at most `slots` workers in flight, then join all
async fn run_batch(
    worker: &Arc<Worker>,
    runtime: &Runtime,
    hosts: &[(usize, Host)],
    slots: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(slots));
    let mut join_set = JoinSet::new();
    let mut cancelled = false;

    for (index, host) in hosts {
        let permit = tokio::select! {
            biased;
            _ = runtime.cancellation_token().cancelled() => {
                cancelled = true;
                break;
            }
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let worker = Arc::clone(worker);
        let runtime = runtime.clone();
        let host = host.clone();
        let index = *index;
        join_set.spawn(async move {
            // Slot released when the worker finishes, however it finishes
            let _permit = permit;
            worker.run(runtime, host, index).await;
        });
    }

    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "host worker aborted");
        }
    }

    if cancelled {
        return Err(PipeError::Cancelled {
            task: worker.task.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// PER-HOST WORKER
// ============================================================================

enum HostOutcome {
    Done,
    Skipped,
}

/// Everything a per-host worker needs, shared across the task's hosts
struct Worker {
    task: Arc<str>,
    prepare: Option<Arc<dyn Prepare>>,
    action: Arc<dyn Action>,
    retry: u32,
    delay: Duration,
    timeout: Duration,
    host_timeout: Option<Duration>,
    local: bool,
    result: TaskResult,
}

impl Worker {
    async fn run(self: Arc<Self>, runtime: Runtime, host: Host, index: usize) {
        let name: Arc<str> = Arc::from(host.name());
        self.result.start(&name);
        let started = Instant::now();

        let flow = AssertUnwindSafe(self.run_host(&runtime, host, index)).catch_unwind();
        let outcome = match self.host_timeout {
            Some(limit) => match tokio::time::timeout(limit, flow).await {
                Ok(joined) => joined,
                Err(_) => Ok(Err(PipeError::TaskTimeout {
                    task: self.task.to_string(),
                    host: name.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                })),
            },
            None => flow.await,
        };
        let outcome = outcome.unwrap_or_else(|panic| {
            Err(PipeError::TaskPanicked {
                task: self.task.to_string(),
                reason: panic_message(panic.as_ref()),
            })
        });

        let events = runtime.events();
        match outcome {
            Ok(HostOutcome::Done) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                info!(host = %name, duration_ms, "success");
                self.result.append_success(&name);
                events.emit(EventKind::HostSucceeded {
                    task: Arc::clone(&self.task),
                    host: name,
                    duration_ms,
                });
            }
            Ok(HostOutcome::Skipped) => {
                info!(host = %name, "skipped");
                self.result.append_skip(&name);
                events.emit(EventKind::HostSkipped {
                    task: Arc::clone(&self.task),
                    host: name,
                });
            }
            Err(e) => {
                error!(host = %name, error = %e, "failed");
                events.emit(EventKind::HostFailed {
                    task: Arc::clone(&self.task),
                    host: Arc::clone(&name),
                    error: e.to_string(),
                });
                self.result.append_err(&name, e);
            }
        }
    }

    async fn run_host(&self, runtime: &Runtime, host: Host, index: usize) -> Result<HostOutcome> {
        let host_name = host.name().to_string();
        let host_ref = &host_name;

        // Bind
        let conn: Arc<dyn Connection> = if self.local {
            Arc::new(LocalConnection::new(host.name()))
        } else {
            let target = &host;
            self.with_retry(runtime, &host_name, "connect", move || {
                self.bounded(host_ref, runtime.connect(target))
            })
            .await?
        };
        let view = runtime.with_runner(Runner::new(Some(conn), host, index));
        let view_ref = &view;

        // Gate
        if let Some(prepare) = &self.prepare {
            let pass = self
                .with_retry(runtime, &host_name, "prepare", move || {
                    self.bounded(host_ref, prepare.pre_check(view_ref))
                })
                .await?;
            if !pass {
                return Ok(HostOutcome::Skipped);
            }
        }

        // Execute
        let action = &self.action;
        self.with_retry(runtime, &host_name, "exec", move || {
            self.bounded(host_ref, action.execute(view_ref))
        })
        .await?;

        Ok(HostOutcome::Done)
    }

    /// One stage attempt, cut off after `timeout`
    async fn bounded<T>(&self, host: &str, attempt: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(r) => r,
            Err(_) => Err(PipeError::TaskTimeout {
                task: self.task.to_string(),
                host: host.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Up to `retry` attempts of `op`, sleeping `delay` between failures
    async fn with_retry<T, F, Fut>(
        &self,
        runtime: &Runtime,
        host: &str,
        stage: &'static str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if attempt >= self.retry {
                return Err(PipeError::RetriesExhausted {
                    task: self.task.to_string(),
                    stage,
                    retries: self.retry,
                    reason: err.to_string(),
                });
            }

            warn!(host, stage, attempt, error = %err, "retrying in {:?}", self.delay);
            runtime.events().emit(EventKind::Retrying {
                task: Arc::clone(&self.task),
                host: Arc::from(host),
                attempt,
                error: err.to_string(),
            });
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = runtime.cancellation_token().cancelled() => {
                    return Err(PipeError::Cancelled { task: self.task.to_string() });
                }
            }
            attempt += 1;
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::action_fn;
    use crate::connector::MockConnector;
    use crate::prepare::{FnPrepare, HasRole};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn runtime_with(connector: MockConnector, n: usize) -> Runtime {
        let mut builder = Runtime::builder("test").connector(Arc::new(connector));
        for i in 1..=n {
            let role = if i == 1 { "master" } else { "worker" };
            builder = builder.host(Host::new(format!("h{}", i), format!("10.0.0.{}", i)).with_role(role));
        }
        builder.without_dirs().build().unwrap()
    }

    fn recording_action(log: Arc<Mutex<Vec<String>>>) -> impl Action {
        action_fn("record", move |rt: Runtime| {
            let log = Arc::clone(&log);
            async move {
                let host = rt.remote_host().map(|h| h.name().to_string()).unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(5)).await;
                log.lock().push(host);
                Ok(())
            }
        })
    }

    #[test]
    fn test_serial_parse() {
        assert_eq!("3".parse::<Serial>().unwrap(), Serial::Count(3));
        assert_eq!("30%".parse::<Serial>().unwrap(), Serial::Percent(30));
        assert!("0".parse::<Serial>().is_err());
        assert!("150%".parse::<Serial>().is_err());
        assert!("abc".parse::<Serial>().is_err());

        let s: Serial = serde_yaml::from_str("2").unwrap();
        assert_eq!(s, Serial::Count(2));
        let s: Serial = serde_yaml::from_str("\"50%\"").unwrap();
        assert_eq!(s, Serial::Percent(50));
    }

    #[test]
    fn test_serial_batch_size() {
        assert_eq!(Serial::Count(2).batch_size(5), 2);
        assert_eq!(Serial::Count(9).batch_size(5), 5);
        assert_eq!(Serial::Percent(50).batch_size(5), 2);
        assert_eq!(Serial::Percent(10).batch_size(5), 1);
        assert_eq!(Serial::Percent(100).batch_size(4), 4);
    }

    #[test]
    fn test_slots() {
        let t = Task::remote("t", action_fn("a", |_rt: Runtime| async { Ok(()) }));
        assert_eq!(t.slots(20), 1);

        let t = t.parallel(true);
        assert_eq!(t.slots(20), 10);
        assert_eq!(t.slots(3), 3);

        let t = t.concurrency(0.5);
        assert_eq!(t.slots(8), 4);
        assert_eq!(t.slots(1), 1);
    }

    #[tokio::test]
    async fn test_sequential_preserves_order() {
        let rt = runtime_with(MockConnector::new(), 3);
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Task::remote("seq", recording_action(Arc::clone(&log)))
            .hosts(rt.all_hosts())
            .parallel(false);

        let result = task.execute(&rt).await.unwrap();
        assert_eq!(*log.lock(), vec!["h1", "h2", "h3"]);
        assert_eq!(result.status(), ResultStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_is_bounded() {
        let rt = runtime_with(MockConnector::new(), 12);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let action = action_fn("block", move |_rt: Runtime| {
            let (f, p) = (Arc::clone(&f), Arc::clone(&p));
            async move {
                let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                f.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let task = Task::remote("par", action)
            .hosts(rt.all_hosts())
            .parallel(true)
            .max_concurrency(3);
        let result = task.execute(&rt).await.unwrap();

        assert_eq!(result.count(ResultStatus::Success), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let rt = runtime_with(MockConnector::new(), 1);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let action = action_fn("flaky", move |_rt: Runtime| {
            let a = Arc::clone(&a);
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(PipeError::action(format!("attempt {} failed", n)))
                } else {
                    Ok(())
                }
            }
        });

        let task = Task::remote("flaky", action)
            .hosts(rt.all_hosts())
            .retry(3)
            .delay(Duration::from_millis(1));
        let result = task.execute(&rt).await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(result.get("h1").unwrap().status, ResultStatus::Success);
        assert_eq!(rt.events().filter_host("h1").len(), 3); // 2 retries + success
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let rt = runtime_with(MockConnector::new(), 1);
        let attempts = Arc::new(AtomicU32::new(0));
        let a = Arc::clone(&attempts);
        let action = action_fn("broken", move |_rt: Runtime| {
            let a = Arc::clone(&a);
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(PipeError::action("always"))
            }
        });

        let task = Task::remote("broken", action)
            .hosts(rt.all_hosts())
            .retry(2)
            .delay(Duration::from_millis(1));
        let err = task.execute(&rt).await.unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let msg = err.to_string();
        assert!(msg.contains("exec failed after 2 retries"), "{}", msg);
    }

    #[tokio::test]
    async fn test_aggregate_failure_names_host() {
        let rt = runtime_with(MockConnector::new(), 3);
        let action = action_fn("h2-fails", |rt: Runtime| async move {
            match rt.remote_host().map(|h| h.name()) {
                Some("h2") => Err(PipeError::action("h2 is broken")),
                _ => Ok(()),
            }
        });

        let task = Task::remote("agg", action)
            .hosts(rt.all_hosts())
            .retry(1)
            .parallel(true);
        let err = task.execute(&rt).await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, PipeError::TaskFailed { failures: 1, .. }));
        assert!(msg.contains("h2 is broken"));

        // Other hosts still ran
        let result = task.dispatch(&rt).await.unwrap();
        assert_eq!(result.get("h1").unwrap().status, ResultStatus::Success);
        assert_eq!(result.get("h3").unwrap().status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn test_ignore_error_returns_result() {
        let rt = runtime_with(MockConnector::new(), 2);
        let action = action_fn("fail", |_rt: Runtime| async { Err(PipeError::action("nope")) });
        let task = Task::remote("ignored", action)
            .hosts(rt.all_hosts())
            .retry(1)
            .ignore_error(true);

        let result = task.execute(&rt).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Failed);
        assert_eq!(result.count(ResultStatus::Failed), 2);
    }

    #[tokio::test]
    async fn test_prepare_false_skips_without_retry() {
        let rt = runtime_with(MockConnector::new(), 3);
        let checks = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&checks);
        let prepare = FnPrepare::new("count", move |rt: &Runtime| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(rt.remote_host().is_some_and(|h| h.has_role("master")))
        });
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Task::remote("masters", recording_action(Arc::clone(&log)))
            .hosts(rt.all_hosts())
            .prepare(prepare)
            .retry(3);

        let result = task.execute(&rt).await.unwrap();
        assert_eq!(checks.load(Ordering::SeqCst), 3);
        assert_eq!(*log.lock(), vec!["h1"]);
        assert_eq!(result.count(ResultStatus::Skipped), 2);
        assert_eq!(result.status(), ResultStatus::Success);
    }

    #[tokio::test]
    async fn test_all_skipped_is_not_failure() {
        let rt = runtime_with(MockConnector::new(), 2);
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Task::remote("none", recording_action(Arc::clone(&log)))
            .hosts(rt.all_hosts())
            .prepare(HasRole::new("etcd"));

        let result = task.execute(&rt).await.unwrap();
        assert_eq!(result.status(), ResultStatus::Skipped);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_error_retried_then_fails() {
        let rt = runtime_with(MockConnector::new(), 1);
        let checks = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&checks);
        let prepare = FnPrepare::new("erroring", move |_rt: &Runtime| {
            c.fetch_add(1, Ordering::SeqCst);
            Err(PipeError::action("cannot check"))
        });
        let task = Task::remote("gated", action_fn("noop", |_rt: Runtime| async { Ok(()) }))
            .hosts(rt.all_hosts())
            .prepare(prepare)
            .retry(2)
            .delay(Duration::from_millis(1));

        let err = task.execute(&rt).await.unwrap_err();
        assert_eq!(checks.load(Ordering::SeqCst), 2);
        assert!(err.to_string().contains("prepare failed after 2 retries"));
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_an_error() {
        let rt = runtime_with(MockConnector::new(), 1);
        let action = action_fn("hang", |_rt: Runtime| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let task = Task::remote("hang", action)
            .hosts(rt.all_hosts())
            .retry(1)
            .timeout(Duration::from_millis(20));

        let result = task.dispatch(&rt).await.unwrap();
        let h1 = result.get("h1").unwrap();
        assert!(h1.is_failed());
        assert!(h1.error.unwrap().to_string().contains("timed out"));
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl Prepare for Stuck {
        async fn pre_check(&self, _runtime: &Runtime) -> Result<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stuck_prepare_times_out() {
        let rt = runtime_with(MockConnector::new(), 1);
        let task = Task::remote("gated", action_fn("noop", |_rt: Runtime| async { Ok(()) }))
            .hosts(rt.all_hosts())
            .prepare(Stuck)
            .retry(2)
            .delay(Duration::from_millis(1))
            .timeout(Duration::from_millis(50));

        let result = tokio::time::timeout(Duration::from_secs(2), task.dispatch(&rt))
            .await
            .expect("task must return despite a stuck prepare")
            .unwrap();
        let err = result.get("h1").unwrap().error.unwrap().to_string();
        assert!(err.contains("prepare failed after 2 retries"), "{}", err);
        assert!(err.contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn test_stuck_connect_times_out() {
        let connector = MockConnector::new().with_connect_delay(Duration::from_secs(60));
        let rt = runtime_with(connector, 1);
        let task = Task::remote("dial", action_fn("noop", |_rt: Runtime| async { Ok(()) }))
            .hosts(rt.all_hosts())
            .retry(1)
            .timeout(Duration::from_millis(50));

        let result = tokio::time::timeout(Duration::from_secs(2), task.dispatch(&rt))
            .await
            .expect("task must return despite a stuck dial")
            .unwrap();
        let err = result.get("h1").unwrap().error.unwrap().to_string();
        assert!(err.contains("connect failed"), "{}", err);
        assert!(err.contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn test_host_timeout_bounds_whole_host() {
        let rt = runtime_with(MockConnector::new(), 1);
        let action = action_fn("slow-fail", |_rt: Runtime| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Err(PipeError::action("slow"))
        });
        let task = Task::remote("bounded", action)
            .hosts(rt.all_hosts())
            .retry(10)
            .delay(Duration::from_millis(30))
            .host_timeout(Duration::from_millis(100));

        let err = task.execute(&rt).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn test_panicking_action_fails_host_only() {
        let rt = runtime_with(MockConnector::new(), 2);
        let action = action_fn("panics", |rt: Runtime| async move {
            if rt.remote_host().map(|h| h.name()) == Some("h1") {
                panic!("action bug");
            }
            Ok(())
        });
        let task = Task::remote("p", action).hosts(rt.all_hosts()).retry(1);

        let result = task.dispatch(&rt).await.unwrap();
        let h1 = result.get("h1").unwrap();
        assert!(h1.error.unwrap().to_string().contains("action bug"));
        assert_eq!(result.get("h2").unwrap().status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn test_unreachable_host_fails() {
        let rt = runtime_with(MockConnector::new().unreachable("h2"), 2);
        let task = Task::remote("connect", action_fn("noop", |_rt: Runtime| async { Ok(()) }))
            .hosts(rt.all_hosts())
            .retry(2)
            .delay(Duration::from_millis(1));

        let result = task.dispatch(&rt).await.unwrap();
        assert_eq!(result.get("h1").unwrap().status, ResultStatus::Success);
        let h2 = result.get("h2").unwrap();
        assert!(h2.error.unwrap().to_string().contains("connect failed"));
    }

    #[tokio::test]
    async fn test_serial_stops_after_failed_batch() {
        let rt = runtime_with(MockConnector::new(), 5);
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = Arc::clone(&log);
        let action = action_fn("rolling", move |rt: Runtime| {
            let l = Arc::clone(&l);
            async move {
                let name = rt.remote_host().map(|h| h.name().to_string()).unwrap_or_default();
                l.lock().push(name.clone());
                if name == "h3" {
                    return Err(PipeError::action("upgrade failed"));
                }
                Ok(())
            }
        });
        let task = Task::remote("rolling", action)
            .hosts(rt.all_hosts())
            .serial(Serial::Count(2))
            .retry(1);

        let err = task.execute(&rt).await.unwrap_err();
        assert!(err.to_string().contains("upgrade failed"));

        let mut ran = log.lock().clone();
        ran.sort();
        assert_eq!(ran, vec!["h1", "h2", "h3", "h4"]);

        let result = task.dispatch(&rt).await.unwrap();
        assert_eq!(result.get("h5").unwrap().status, ResultStatus::Pending);
    }

    #[tokio::test]
    async fn test_deleted_host_not_dispatched() {
        let rt = runtime_with(MockConnector::new(), 3);
        let hosts = rt.all_hosts();
        rt.delete_host("h2");

        let log = Arc::new(Mutex::new(Vec::new()));
        let task = Task::remote("t", recording_action(Arc::clone(&log))).hosts(hosts);
        task.execute(&rt).await.unwrap();
        assert_eq!(*log.lock(), vec!["h1", "h3"]);
    }

    #[tokio::test]
    async fn test_local_task_runs_once() {
        let rt = runtime_with(MockConnector::new(), 3);
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        let action = action_fn("download", move |rt: Runtime| {
            let r = Arc::clone(&r);
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                assert_eq!(rt.remote_host().map(|h| h.name()), Some("localhost"));
                rt.runner()?.cmd("true", false).await?;
                Ok(())
            }
        });

        let task = Task::local("download", action).hosts(rt.all_hosts());
        let result = task.execute(&rt).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.results().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let rt = runtime_with(MockConnector::new(), 2);
        rt.cancel();
        let task = Task::remote("t", action_fn("noop", |_rt: Runtime| async { Ok(()) }))
            .hosts(rt.all_hosts())
            .parallel(true);
        let err = task.execute(&rt).await.unwrap_err();
        assert!(matches!(err, PipeError::Cancelled { .. }));
    }
}
