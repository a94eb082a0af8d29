//! Process signals that stop the scheduler loop.

use std::io;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{Signal, SignalKind, signal};

/// Handlers for SIGINT, SIGTERM and SIGQUIT, installed on construction so no
/// signal sent afterwards is lost.
#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next signal and returns its name.
    pub async fn recv(&mut self) -> &'static str {
        let name = tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.quit.recv() => "SIGQUIT",
        };
        info!(signal = name, "shutdown signal received");
        name
    }
}

#[cfg(unix)]
pub async fn shutdown_signal() -> io::Result<()> {
    ShutdownSignals::install()?.recv().await;
    Ok(())
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "ctrl-c", "shutdown signal received");
    Ok(())
}
