use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use crate::notifier::deliver_alert;
use crate::{AlertEvent, DagtickError, DependencyGraph, Notifier, RetryExecutor, RetryPolicy, Task};

pub const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

pub type PolicyFactory = Arc<dyn Fn(&Task) -> RetryPolicy + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub order: Vec<String>,
    pub states: BTreeMap<String, TaskState>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Runs the graph's tasks one after another in topological order.
///
/// The first task that exhausts its retries aborts the run: the remaining
/// tasks stay `Pending`, one alert goes to the notifier and the failure is
/// returned.
pub struct PipelineRunner {
    graph: Arc<DependencyGraph>,
    notifier: Arc<dyn Notifier>,
    policy_factory: PolicyFactory,
    notify_timeout: Duration,
    states: Mutex<BTreeMap<String, TaskState>>,
    execution_order: Mutex<Vec<String>>,
}

impl PipelineRunner {
    /// Takes ownership of the graph; it cannot change after this point.
    pub fn new(graph: DependencyGraph, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            graph: Arc::new(graph),
            notifier,
            policy_factory: Arc::new(|_: &Task| RetryPolicy::default()),
            notify_timeout: DEFAULT_NOTIFY_TIMEOUT,
            states: Mutex::new(BTreeMap::new()),
            execution_order: Mutex::new(Vec::new()),
        }
    }

    pub fn with_policy_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&Task) -> RetryPolicy + Send + Sync + 'static,
    {
        self.policy_factory = Arc::new(factory);
        self
    }

    pub fn with_default_policy(self, policy: RetryPolicy) -> Self {
        self.with_policy_factory(move |_| policy.clone())
    }

    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub async fn execute(&self, ctx: CancellationToken) -> Result<RunReport, DagtickError> {
        let started_at = Utc::now();
        let start = Instant::now();

        let tasks = self.graph.ordered_tasks()?;
        let order: Vec<String> = tasks.iter().map(|t| t.name().to_string()).collect();

        self.reset(&order).await;
        info!(started_at = %started_at.to_rfc3339(), order = ?order, "pipeline started");

        for task in tasks {
            if ctx.is_cancelled() {
                return Err(DagtickError::Cancelled(format!(
                    "run cancelled before task '{}'",
                    task.name()
                )));
            }

            self.set_state(task.name(), TaskState::Running).await;
            let policy = (self.policy_factory)(task);

            let result = match RetryExecutor::new(policy) {
                Ok(executor) => {
                    executor
                        .execute_with_retry(&ctx, task.name(), |_| task.run())
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.set_state(task.name(), TaskState::Succeeded).await;
                    self.execution_order.lock().await.push(task.name().to_string());
                    info!(task = task.name(), "task succeeded");
                }
                Err(DagtickError::TaskFailed(failure)) => {
                    self.set_state(task.name(), TaskState::Failed).await;
                    error!(task = task.name(), error = %failure, "task failed, aborting run");

                    let alert = AlertEvent::new(failure.to_string()).with_task(task.name());
                    deliver_alert(self.notifier.as_ref(), &alert, self.notify_timeout).await;

                    return Err(DagtickError::TaskFailed(failure));
                }
                Err(DagtickError::Cancelled(reason)) => {
                    self.set_state(task.name(), TaskState::Pending).await;
                    return Err(DagtickError::Cancelled(reason));
                }
                Err(e) => {
                    self.set_state(task.name(), TaskState::Failed).await;
                    error!(task = task.name(), error = %e, "task could not be started");
                    return Err(e);
                }
            }
        }

        let duration = start.elapsed();
        info!(duration_ms = duration.as_millis() as u64, "pipeline completed");

        Ok(RunReport {
            order,
            states: self.task_states().await,
            started_at,
            duration,
        })
    }

    /// State of every task in the current or most recent run.
    pub async fn task_states(&self) -> BTreeMap<String, TaskState> {
        self.states.lock().await.clone()
    }

    /// Tasks that succeeded in the current or most recent run, in completion order.
    pub async fn completed_tasks(&self) -> Vec<String> {
        self.execution_order.lock().await.clone()
    }

    /// Marks a run whose future was dropped mid-flight: any `Running` task
    /// goes back to `Pending`, the same as a cancelled run.
    pub async fn abandon(&self) {
        let mut states = self.states.lock().await;
        for state in states.values_mut() {
            if *state == TaskState::Running {
                *state = TaskState::Pending;
            }
        }
    }

    async fn reset(&self, order: &[String]) {
        let mut states = self.states.lock().await;
        states.clear();
        for name in order {
            states.insert(name.clone(), TaskState::Pending);
        }
        self.execution_order.lock().await.clear();
    }

    async fn set_state(&self, name: &str, state: TaskState) {
        self.states.lock().await.insert(name.to_string(), state);
    }
}
