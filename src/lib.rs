pub mod command;
pub mod config;
pub mod cycle_check;
pub mod executor;
pub mod graph;
pub mod notifier;
pub mod retry;
pub mod scheduler;
pub mod signal;
pub mod task;

pub use command::ShellCommand;
pub use config::{Config, ConfigError};
pub use cycle_check::find_cycle;
pub use executor::{PipelineRunner, RunReport, TaskState};
pub use graph::{DependencyGraph, format_order};
pub use notifier::{AlertEvent, CommandNotifier, LogNotifier, MemoryNotifier, Notifier, NotifierError};
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::{OverlapPolicy, Scheduler, SchedulerReport, ShutdownPolicy};
pub use task::{Task, Work};

use std::any::Any;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DagtickError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),
    #[error("task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },
    #[error("cyclic dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error(transparent)]
    TaskFailed(#[from] TerminalFailure),
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("context cancelled: {0}")]
    Cancelled(String),
}

/// A task that used up its whole retry budget.
#[derive(Error, Debug)]
#[error("task '{task_name}' failed after {attempts} attempt(s): {last_error:#}")]
pub struct TerminalFailure {
    pub task_name: String,
    pub attempts: u32,
    pub last_error: anyhow::Error,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
