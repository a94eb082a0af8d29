use anyhow::{Context, bail};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;
use crate::Work;

const STDERR_TAIL_LINES: usize = 5;

/// Work unit that runs a shell command; a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    timeout: Option<Duration>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Work for ShellCommand {
    async fn run(&self) -> anyhow::Result<()> {
        let mut cmd = shell(&self.command);
        cmd.stdin(Stdio::null());
        let output = cmd.output();

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, output)
                .await
                .map_err(|_| anyhow::anyhow!("`{}` timed out after {:?}", self.command, timeout))?,
            None => output.await,
        }
        .with_context(|| format!("failed to spawn `{}`", self.command))?;

        for line in output_lines(&output.stdout) {
            info!(command = %self.command, "{line}");
        }
        if !output.status.success() {
            let stderr = stderr_tail(&output.stderr);
            if stderr.is_empty() {
                bail!("`{}` exited with {}", self.command, output.status);
            }
            bail!("`{}` exited with {}: {}", self.command, output.status, stderr);
        }
        Ok(())
    }
}

/// `sh -c <command>`, killed if the owning future is dropped.
pub(crate) fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    cmd
}

/// Non-blank lines of captured output, trailing whitespace trimmed.
pub(crate) fn output_lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_exit_succeeds() {
        ShellCommand::new("true").run().await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_stderr() {
        let err = ShellCommand::new("echo 'connection refused' >&2; exit 3")
            .run()
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("connection refused"), "{msg}");
        assert!(msg.contains('3'), "{msg}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = ShellCommand::new("sleep 5")
            .with_timeout(Duration::from_millis(50))
            .run()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn stdout_does_not_affect_outcome() {
        ShellCommand::new("echo 'Extracting data...'; echo done")
            .run()
            .await
            .unwrap();
    }

    #[test]
    fn output_lines_drop_blank_lines() {
        assert_eq!(
            output_lines(b"Extracting data...\n\n  \nrows=42  \n"),
            ["Extracting data...", "rows=42"]
        );
        assert!(output_lines(b"").is_empty());
    }

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let stderr = b"1\n2\n3\n4\n5\n6\n7\n";
        assert_eq!(stderr_tail(stderr), "3\n4\n5\n6\n7");
        assert_eq!(stderr_tail(b"  \n"), "");
    }
}
