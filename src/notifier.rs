//! Alert delivery for aborted pipeline runs.
//!
//! Delivery is best effort: [`deliver_alert`] bounds every call with a
//! timeout and only logs failures, so a broken notifier never takes the
//! scheduler down with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};
use crate::command::{shell, stderr_tail};
use crate::panic_message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub timestamp: DateTime<Utc>,
    pub task_name: Option<String>,
    pub message: String,
}

impl AlertEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            task_name: None,
            message: message.into(),
        }
    }

    pub fn with_task(mut self, task_name: impl Into<String>) -> Self {
        self.task_name = Some(task_name.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("alert delivery failed: {0}")]
    Delivery(String),
    #[error("alert delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("notifier panicked: {0}")]
    Panicked(String),
    #[error("failed to encode alert: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError>;
}

/// Hands `event` to `notifier` under `timeout`. Returns whether it was delivered.
pub async fn deliver_alert(notifier: &dyn Notifier, event: &AlertEvent, timeout: Duration) -> bool {
    let send = AssertUnwindSafe(notifier.send(event)).catch_unwind();
    let result = match tokio::time::timeout(timeout, send).await {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(NotifierError::Panicked(panic_message(&*payload))),
        Err(_) => Err(NotifierError::Timeout(timeout)),
    };

    match result {
        Ok(()) => {
            info!(task = ?event.task_name, "alert delivered");
            true
        }
        Err(e) => {
            error!(error = %e, alert = %event.message, "failed to deliver alert");
            false
        }
    }
}

/// Writes alerts to the log at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        error!(
            timestamp = %event.timestamp.to_rfc3339(),
            task = ?event.task_name,
            "ALERT: {}", event.message
        );
        Ok(())
    }
}

/// Keeps every alert in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<AlertEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// Runs a shell command per alert, with the event as JSON on stdin.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, event: &AlertEvent) -> Result<(), NotifierError> {
        let payload = serde_json::to_vec(event)?;

        let mut cmd = shell(&self.command);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
            // closing stdin lets the command see EOF
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(NotifierError::Delivery(format!(
                "`{}` exited with {}: {}",
                self.command,
                output.status,
                stderr_tail(&output.stderr)
            )));
        }
        Ok(())
    }
}
