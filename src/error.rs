//! Error types with error codes and fix suggestions
//!
//! Error code ranges:
//! - PIPE-000-009: Configuration / inventory errors
//! - PIPE-010-019: Connection / runner errors
//! - PIPE-020-029: Prepare / action / cache errors
//! - PIPE-030-039: Task errors
//! - PIPE-040-049: Module / pipeline errors

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipeError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum PipeError {
    // ═══════════════════════════════════════════
    // CONFIGURATION / INVENTORY (000-009)
    // ═══════════════════════════════════════════
    #[error("[PIPE-000] Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("[PIPE-001] [{host}] is in [{role}] group, but not in hosts list")]
    UnknownHost { host: String, role: String },

    #[error("[PIPE-002] The number of {role} hosts cannot be 0")]
    EmptyRole { role: String },

    #[error("[PIPE-003] Invalid host range '{pattern}': {reason}")]
    InvalidRange { pattern: String, reason: String },

    #[error("[PIPE-004] Invalid serial value '{value}' (expected N or N%)")]
    InvalidSerial { value: String },

    #[error("[PIPE-005] Duplicate host '{host}' in inventory")]
    DuplicateHost { host: String },

    // ═══════════════════════════════════════════
    // CONNECTION / RUNNER (010-019)
    // ═══════════════════════════════════════════
    #[error("[PIPE-010] Failed to connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    #[error("[PIPE-011] No connection available for host '{host}'")]
    NoConnection { host: String },

    #[error("[PIPE-012] Command failed on {host} (exit {exit_code}): {command}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("[PIPE-013] Transfer failed on {host}: {reason}")]
    Transfer { host: String, reason: String },

    // ═══════════════════════════════════════════
    // PREPARE / ACTION / CACHE (020-029)
    // ═══════════════════════════════════════════
    #[error("[PIPE-020] Prepare failed on {host}: {reason}")]
    PrepareFailed { host: String, reason: String },

    #[error("[PIPE-021] Action failed: {reason}")]
    ActionFailed { reason: String },

    #[error("[PIPE-022] Cache key '{key}' holds a value of another type")]
    CacheTypeMismatch { key: String },

    #[error("[PIPE-023] Cache key '{key}' not found")]
    CacheMissing { key: String },

    // ═══════════════════════════════════════════
    // TASK (030-039)
    // ═══════════════════════════════════════════
    #[error("[PIPE-030] Task '{task}' timed out on {host} after {timeout_ms}ms")]
    TaskTimeout {
        task: String,
        host: String,
        timeout_ms: u64,
    },

    #[error("[PIPE-031] [{task}] {stage} failed after {retries} retries: {reason}")]
    RetriesExhausted {
        task: String,
        stage: &'static str,
        retries: u32,
        reason: String,
    },

    #[error("[PIPE-032] Task '{task}' failed on {failures} host(s): {details}")]
    TaskFailed {
        task: String,
        failures: usize,
        details: String,
    },

    #[error("[PIPE-033] Task '{task}' worker panicked: {reason}")]
    TaskPanicked { task: String, reason: String },

    #[error("[PIPE-034] Task '{task}' cancelled")]
    Cancelled { task: String },

    // ═══════════════════════════════════════════
    // MODULE / PIPELINE (040-049)
    // ═══════════════════════════════════════════
    #[error("[PIPE-040] Module '{module}' failed: {source}")]
    ModuleFailed {
        module: String,
        #[source]
        source: Box<PipeError>,
    },

    #[error("[PIPE-041] Post-hook for module '{module}' failed: {reason}")]
    HookFailed { module: String, reason: String },

    #[error("[PIPE-042] Module '{module}' did not converge after {rounds} rounds")]
    UntilExhausted { module: String, rounds: u32 },

    // ═══════════════════════════════════════════
    // PASS-THROUGH
    // ═══════════════════════════════════════════
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipeError {
    /// Shorthand for an action-level failure
    pub fn action(reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            reason: reason.into(),
        }
    }

    /// Check if this error (or the error it wraps) is a timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::TaskTimeout { .. } => true,
            Self::ModuleFailed { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Extract the error code (e.g. "PIPE-032") if the variant carries one
    pub fn code(&self) -> Option<&'static str> {
        let code = match self {
            Self::InvalidConfig { .. } => "PIPE-000",
            Self::UnknownHost { .. } => "PIPE-001",
            Self::EmptyRole { .. } => "PIPE-002",
            Self::InvalidRange { .. } => "PIPE-003",
            Self::InvalidSerial { .. } => "PIPE-004",
            Self::DuplicateHost { .. } => "PIPE-005",
            Self::Connection { .. } => "PIPE-010",
            Self::NoConnection { .. } => "PIPE-011",
            Self::CommandFailed { .. } => "PIPE-012",
            Self::Transfer { .. } => "PIPE-013",
            Self::PrepareFailed { .. } => "PIPE-020",
            Self::ActionFailed { .. } => "PIPE-021",
            Self::CacheTypeMismatch { .. } => "PIPE-022",
            Self::CacheMissing { .. } => "PIPE-023",
            Self::TaskTimeout { .. } => "PIPE-030",
            Self::RetriesExhausted { .. } => "PIPE-031",
            Self::TaskFailed { .. } => "PIPE-032",
            Self::TaskPanicked { .. } => "PIPE-033",
            Self::Cancelled { .. } => "PIPE-034",
            Self::ModuleFailed { .. } => "PIPE-040",
            Self::HookFailed { .. } => "PIPE-041",
            Self::UntilExhausted { .. } => "PIPE-042",
            Self::Io(_) | Self::Yaml(_) => return None,
        };
        Some(code)
    }
}

impl FixSuggestion for PipeError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            PipeError::InvalidConfig { .. } => Some("Check the config file against the documented fields"),
            PipeError::UnknownHost { .. } => {
                Some("Add the host to the hosts list or fix the name in roleGroups")
            }
            PipeError::EmptyRole { .. } => Some("Assign at least one host to this role in roleGroups"),
            PipeError::InvalidRange { .. } => Some("Use a range like node[1:3] with start <= end"),
            PipeError::InvalidSerial { .. } => Some("Use a positive integer (2) or a percentage (30%)"),
            PipeError::DuplicateHost { .. } => Some("Host names must be unique"),
            PipeError::Connection { .. } => {
                Some("Check address, port and credentials; try `ssh user@host` manually")
            }
            PipeError::NoConnection { .. } => Some("Bind a runner before calling remote operations"),
            PipeError::CommandFailed { .. } => Some("Inspect stderr above and rerun the command on the host"),
            PipeError::Transfer { .. } => Some("Check the remote path exists and is writable"),
            PipeError::PrepareFailed { .. } => None,
            PipeError::ActionFailed { .. } => None,
            PipeError::CacheTypeMismatch { .. } => {
                Some("Producer and consumer must agree on the value type for this key")
            }
            PipeError::CacheMissing { .. } => {
                Some("Make sure the task that writes this key runs in an earlier module")
            }
            PipeError::TaskTimeout { .. } => Some("Raise the task timeout or check the host is responsive"),
            PipeError::RetriesExhausted { .. } => None,
            PipeError::TaskFailed { .. } => Some("Set ignore_error on the task to continue past host failures"),
            PipeError::TaskPanicked { .. } => Some("This is a bug in the action; check the logs for the panic"),
            PipeError::Cancelled { .. } => None,
            PipeError::ModuleFailed { source, .. } => source.fix_suggestion(),
            PipeError::HookFailed { .. } => None,
            PipeError::UntilExhausted { .. } => Some("Raise max_rounds or check the until condition"),
            PipeError::Io(_) => Some("Check file path and permissions"),
            PipeError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
        }
    }
}
