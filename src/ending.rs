//! Per-host outcomes and their task-level aggregate

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::PipeError;

/// Outcome of one host within one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Not run yet
    Pending,
    Success,
    Failed,
    /// Prepare returned false; excluded from failure aggregation
    Skipped,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Success => "success",
            ResultStatus::Failed => "failed",
            ResultStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Per-host record ("ending") of a task execution
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub host: String,
    pub status: ResultStatus,
    pub error: Option<Arc<PipeError>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl ActionResult {
    fn pending(host: &str) -> Self {
        Self {
            host: host.to_string(),
            status: ResultStatus::Pending,
            error: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResultStatus::Failed
    }
}

#[derive(Default)]
struct Inner {
    /// Host order as passed to the task
    order: Vec<String>,
    results: HashMap<String, ActionResult>,
}

/// Aggregate of one task execution: one [`ActionResult`] per host
///
/// Cloneable handle; per-host workers write through their own clone.
/// A host result is written once; a failed result is never overwritten.
#[derive(Clone, Default)]
pub struct TaskResult {
    inner: Arc<Mutex<Inner>>,
}

impl TaskResult {
    /// Fresh result with every host `Pending`
    pub fn new<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut inner = Inner::default();
        for h in hosts {
            inner.order.push(h.to_string());
            inner.results.insert(h.to_string(), ActionResult::pending(h));
        }
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Mark the start of work on `host`
    pub fn start(&self, host: &str) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.results.get_mut(host) {
            if r.status == ResultStatus::Pending {
                r.start_time = Utc::now();
            }
        }
    }

    pub fn append_success(&self, host: &str) {
        self.record(host, ResultStatus::Success, None);
    }

    pub fn append_skip(&self, host: &str) {
        self.record(host, ResultStatus::Skipped, None);
    }

    pub fn append_err(&self, host: &str, err: PipeError) {
        self.record(host, ResultStatus::Failed, Some(Arc::new(err)));
    }

    fn record(&self, host: &str, status: ResultStatus, error: Option<Arc<PipeError>>) {
        let mut inner = self.inner.lock();
        if !inner.results.contains_key(host) {
            inner.order.push(host.to_string());
        }
        let entry = inner
            .results
            .entry(host.to_string())
            .or_insert_with(|| ActionResult::pending(host));

        // First failure wins for this host
        if entry.status == ResultStatus::Failed {
            return;
        }
        entry.status = status;
        entry.error = error;
        entry.end_time = Some(Utc::now());
    }

    /// Aggregate status
    ///
    /// Failed if any host failed, Skipped if no host ran (all skipped or
    /// pending), Success otherwise.
    pub fn status(&self) -> ResultStatus {
        let inner = self.inner.lock();
        let mut any_ran = false;
        for r in inner.results.values() {
            match r.status {
                ResultStatus::Failed => return ResultStatus::Failed,
                ResultStatus::Success => any_ran = true,
                ResultStatus::Skipped | ResultStatus::Pending => {}
            }
        }
        if any_ran {
            ResultStatus::Success
        } else {
            ResultStatus::Skipped
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status() == ResultStatus::Failed
    }

    pub fn get(&self, host: &str) -> Option<ActionResult> {
        self.inner.lock().results.get(host).cloned()
    }

    /// Results in host order
    pub fn results(&self) -> Vec<ActionResult> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|h| inner.results.get(h).cloned())
            .collect()
    }

    pub fn count(&self, status: ResultStatus) -> usize {
        self.inner
            .lock()
            .results
            .values()
            .filter(|r| r.status == status)
            .count()
    }

    /// Failed hosts with their errors, in host order
    pub fn failures(&self) -> Vec<(String, Arc<PipeError>)> {
        self.results()
            .into_iter()
            .filter_map(|r| r.error.map(|e| (r.host, e)))
            .collect()
    }

    /// Combined error naming every failed host, or `None`
    pub fn combined_error(&self, task: &str) -> Option<PipeError> {
        let failures = self.failures();
        if failures.is_empty() {
            return None;
        }
        let details = failures
            .iter()
            .enumerate()
            .map(|(i, (host, err))| format!("[{}] {}: {}", i, host, err))
            .collect::<Vec<_>>()
            .join("; ");
        Some(PipeError::TaskFailed {
            task: task.to_string(),
            failures: failures.len(),
            details,
        })
    }
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("status", &self.status())
            .field("hosts", &self.inner.lock().order.len())
            .finish()
    }
}
