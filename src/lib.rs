//! kubepipe - pipeline execution engine for cluster lifecycle over SSH
//!
//! Pipeline -> Module -> Task -> (Prepare, Action) -> Runner -> Connection

pub mod action;
pub mod cache;
pub mod config;
pub mod connector;
pub mod ending;
pub mod error;
pub mod event_log;
pub mod host;
pub mod inventory;
pub mod module;
pub mod pipeline;
pub mod prepare;
pub mod runner;
pub mod runtime;
pub mod task;

pub use action::{action_fn, Action, CommandAction, CopyAction, FnAction, MkdirAction};
pub use cache::{Cache, CacheKey};
pub use config::EngineConfig;
pub use connector::{CommandOutput, Connection, Connector, DefaultConnector, Dialer};
pub use ending::{ActionResult, ResultStatus, TaskResult};
pub use error::{FixSuggestion, PipeError, Result};
pub use event_log::{Event, EventKind, EventLog};
pub use host::{Host, HostSpec};
pub use inventory::{EtcdType, Inventory, InventorySpec};
pub use module::{Module, PostHook, TaskModule};
pub use pipeline::Pipeline;
pub use prepare::{
    Always, CacheKeyAbsent, CacheKeyPresent, CacheScope, FirstOfRole, FnPrepare, HasRole, Not,
    Prepare, PrepareCollection,
};
pub use runner::Runner;
pub use runtime::{Runtime, RuntimeBuilder};
pub use task::{Serial, Task, TaskMode};
