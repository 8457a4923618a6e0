//! Event log for pipeline execution
//!
//! Append-only audit trail of pipeline, module, task and host transitions.
//! - Event: envelope with id + timestamp + kind
//! - EventKind: variants across 4 levels (pipeline/module/task/host)
//! - EventLog: thread-safe, cloneable handle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the pipeline execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since log creation (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All possible event types
///
/// Uses Arc<str> for names to keep cloning cheap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // PIPELINE LEVEL
    // ═══════════════════════════════════════════
    PipelineStarted {
        pipeline: Arc<str>,
        module_count: usize,
    },
    PipelineCompleted {
        pipeline: Arc<str>,
        duration_ms: u64,
    },
    PipelineFailed {
        pipeline: Arc<str>,
        error: String,
        failed_module: Option<Arc<str>>,
    },

    // ═══════════════════════════════════════════
    // MODULE LEVEL
    // ═══════════════════════════════════════════
    ModuleStarted {
        module: Arc<str>,
    },
    ModuleSkipped {
        module: Arc<str>,
    },
    ModuleCompleted {
        module: Arc<str>,
        duration_ms: u64,
    },
    ModuleFailed {
        module: Arc<str>,
        error: String,
    },

    // ═══════════════════════════════════════════
    // TASK LEVEL
    // ═══════════════════════════════════════════
    TaskStarted {
        task: Arc<str>,
        hosts: Vec<Arc<str>>,
    },
    TaskCompleted {
        task: Arc<str>,
        /// Aggregate status: success, failed or skipped
        status: String,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // HOST LEVEL (one per task x host)
    // ═══════════════════════════════════════════
    HostSucceeded {
        task: Arc<str>,
        host: Arc<str>,
        duration_ms: u64,
    },
    HostSkipped {
        task: Arc<str>,
        host: Arc<str>,
    },
    HostFailed {
        task: Arc<str>,
        host: Arc<str>,
        error: String,
    },
    Retrying {
        task: Arc<str>,
        host: Arc<str>,
        attempt: u32,
        error: String,
    },
}

impl EventKind {
    /// Extract the task name if the event is task- or host-related
    pub fn task(&self) -> Option<&str> {
        match self {
            Self::TaskStarted { task, .. }
            | Self::TaskCompleted { task, .. }
            | Self::HostSucceeded { task, .. }
            | Self::HostSkipped { task, .. }
            | Self::HostFailed { task, .. }
            | Self::Retrying { task, .. } => Some(task),
            _ => None,
        }
    }

    /// Extract the host name if the event is host-level
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::HostSucceeded { host, .. }
            | Self::HostSkipped { host, .. }
            | Self::HostFailed { host, .. }
            | Self::Retrying { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Check if this is a pipeline-level event
    pub fn is_pipeline_event(&self) -> bool {
        matches!(
            self,
            Self::PipelineStarted { .. }
                | Self::PipelineCompleted { .. }
                | Self::PipelineFailed { .. }
        )
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    pub fn filter_task(&self, task: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.task() == Some(task))
            .collect()
    }

    pub fn filter_host(&self, host: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.host() == Some(host))
            .collect()
    }

    pub fn pipeline_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind.is_pipeline_event())
            .collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}
