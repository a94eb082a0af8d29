use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use crate::executor::DEFAULT_NOTIFY_TIMEOUT;
use crate::scheduler::{DEFAULT_PERIOD, MAX_PERIOD};
use crate::{
    CommandNotifier, DagtickError, DependencyGraph, LogNotifier, Notifier, OverlapPolicy,
    PipelineRunner, RetryPolicy, Scheduler, ShellCommand, ShutdownPolicy, Task,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub period_secs: u64,
    pub notify_timeout_secs: u64,
    pub overlap: OverlapPolicy,
    pub shutdown: ShutdownPolicy,
    pub alert_command: Option<String>,
    pub retry: RetrySettings,
    #[serde(rename = "task")]
    pub tasks: Vec<TaskConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            period_secs: DEFAULT_PERIOD.as_secs(),
            notify_timeout_secs: DEFAULT_NOTIFY_TIMEOUT.as_secs(),
            overlap: OverlapPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            alert_command: None,
            retry: RetrySettings::default(),
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub jitter_secs: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 2.0,
            jitter_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub max_attempts: Option<u32>,
    pub base_delay_secs: Option<f64>,
    pub jitter_secs: Option<f64>,
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Config::from_file path={}", path.display());
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = raw.parse()?;
        debug!(
            "Config loaded: period_secs={}, tasks={}",
            config.period_secs,
            config.tasks.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_secs == 0 {
            return Err(ConfigError::Invalid("period_secs must be at least 1".to_string()));
        }
        if self.period_secs > MAX_PERIOD.as_secs() {
            return Err(ConfigError::Invalid(format!(
                "period_secs must not exceed {}",
                MAX_PERIOD.as_secs()
            )));
        }
        check_retry("retry", Some(self.retry.max_attempts), Some(self.retry.base_delay_secs), Some(self.retry.jitter_secs))?;

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.name.is_empty() {
                return Err(ConfigError::Invalid("task name must not be empty".to_string()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate task '{}'", task.name)));
            }
            if task.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "task '{}': timeout_secs must be at least 1",
                    task.name
                )));
            }
            check_retry(
                &format!("task '{}'", task.name),
                task.max_attempts,
                task.base_delay_secs,
                task.jitter_secs,
            )?;
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn default_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_secs_f64(self.retry.base_delay_secs),
            jitter: Duration::from_secs_f64(self.retry.jitter_secs),
        }
    }

    /// The default policy with any per-task overrides applied.
    pub fn policy_for(&self, task_name: &str) -> RetryPolicy {
        let mut policy = self.default_policy();
        if let Some(task) = self.tasks.iter().find(|t| t.name == task_name) {
            if let Some(max_attempts) = task.max_attempts {
                policy.max_attempts = max_attempts;
            }
            if let Some(base) = task.base_delay_secs {
                policy.base_delay = Duration::from_secs_f64(base);
            }
            if let Some(jitter) = task.jitter_secs {
                policy.jitter = Duration::from_secs_f64(jitter);
            }
        }
        policy
    }

    pub fn build_graph(&self) -> Result<DependencyGraph, DagtickError> {
        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            let mut work = ShellCommand::new(&task.command);
            if let Some(secs) = task.timeout_secs {
                work = work.with_timeout(Duration::from_secs(secs));
            }
            graph.add_task(Task::from_arc(
                &task.name,
                Arc::new(work),
                task.depends_on.iter().cloned(),
            ))?;
        }
        Ok(graph)
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        match &self.alert_command {
            Some(command) => Arc::new(CommandNotifier::new(command)),
            None => Arc::new(LogNotifier),
        }
    }

    pub fn build_runner(&self, graph: DependencyGraph) -> PipelineRunner {
        let default = self.default_policy();
        let policies: BTreeMap<String, RetryPolicy> = self
            .tasks
            .iter()
            .map(|t| (t.name.clone(), self.policy_for(&t.name)))
            .collect();

        PipelineRunner::new(graph, self.notifier())
            .with_notify_timeout(self.notify_timeout())
            .with_policy_factory(move |task| {
                policies.get(task.name()).cloned().unwrap_or_else(|| default.clone())
            })
    }

    pub fn build_scheduler(&self, graph: DependencyGraph) -> Result<Scheduler, DagtickError> {
        let runner = Arc::new(self.build_runner(graph));
        Ok(Scheduler::new(runner, self.period())?
            .with_overlap_policy(self.overlap)
            .with_shutdown_policy(self.shutdown))
    }
}

fn check_retry(
    scope: &str,
    max_attempts: Option<u32>,
    base_delay_secs: Option<f64>,
    jitter_secs: Option<f64>,
) -> Result<(), ConfigError> {
    if max_attempts == Some(0) {
        return Err(ConfigError::Invalid(format!("{scope}: max_attempts must be at least 1")));
    }
    if let Some(base) = base_delay_secs {
        if !(base > 0.0 && Duration::try_from_secs_f64(base).is_ok()) {
            return Err(ConfigError::Invalid(format!("{scope}: base_delay_secs must be positive")));
        }
    }
    if let Some(jitter) = jitter_secs {
        if Duration::try_from_secs_f64(jitter).is_err() {
            return Err(ConfigError::Invalid(format!("{scope}: jitter_secs must not be negative")));
        }
    }
    Ok(())
}
