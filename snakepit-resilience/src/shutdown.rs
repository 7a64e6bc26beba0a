//! Shutdown coordination
//!
//! [`ShutdownCoordinator`] broadcasts a stop signal to background tasks.
//! [`ProcessShutdownManager`] takes a child process down with escalating
//! signals so that it never outlives its owner.

use log::{debug, error, info, warn};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Shutdown signal types with escalating urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Finish the current iteration, then stop
    Graceful,
    /// Stop immediately
    Forced,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Forced => write!(f, "forced"),
        }
    }
}

/// Broadcasts shutdown to any number of background tasks
pub struct ShutdownCoordinator {
    sender: broadcast::Sender<ShutdownSignal>,
    is_shutting_down: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            is_shutting_down: AtomicBool::new(false),
        }
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Send `signal` to every subscriber
    ///
    /// A second graceful request is rejected; a forced one is always sent.
    pub fn signal(&self, signal: ShutdownSignal) -> Result<(), ShutdownError> {
        let already = self.is_shutting_down.swap(true, Ordering::SeqCst);
        if already && signal == ShutdownSignal::Graceful {
            return Err(ShutdownError::AlreadyShuttingDown);
        }

        info!("Broadcasting {} shutdown", signal);
        if self.sender.send(signal).is_err() {
            debug!("No background tasks subscribed to shutdown");
        }
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// How far termination had to escalate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPhase {
    /// The process had already exited
    AlreadyExited,
    /// The process exited after SIGTERM
    Terminated,
    /// The process had to be killed
    Killed,
}

#[derive(Debug, Clone, Copy)]
pub struct TerminationReport {
    pub phase: TerminationPhase,
    pub status: ExitStatus,
}

/// Process shutdown with escalating signals
pub struct ProcessShutdownManager;

impl ProcessShutdownManager {
    /// Terminate `child`: SIGTERM (Unix), wait up to `grace`, then kill
    pub async fn shutdown_process(
        child: &mut Child,
        grace: Duration,
    ) -> Result<TerminationReport, ShutdownError> {
        if let Some(status) = child.try_wait().map_err(|e| ShutdownError::TaskError(e.to_string()))? {
            return Ok(TerminationReport {
                phase: TerminationPhase::AlreadyExited,
                status,
            });
        }

        if let Some(id) = child.id() {
            debug!("Sending SIGTERM to process {}", id);

            #[cfg(unix)]
            {
                use nix::sys::signal::{self, Signal};
                use nix::unistd::Pid;

                if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                    warn!("Failed to send SIGTERM to process {}: {}", id, e);
                }
            }

            match timeout(grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!("Process {} terminated with status: {}", id, status);
                    return Ok(TerminationReport {
                        phase: TerminationPhase::Terminated,
                        status,
                    });
                }
                Ok(Err(e)) => error!("Error waiting for process {}: {}", id, e),
                Err(_) => warn!("Process {} ignored SIGTERM for {:?}", id, grace),
            }
        }

        warn!("Killing process");
        if let Err(e) = child.start_kill() {
            error!("Failed to kill process: {}", e);
            return Err(ShutdownError::TaskError(e.to_string()));
        }

        match timeout(grace.max(Duration::from_secs(1)), child.wait()).await {
            Ok(Ok(status)) => Ok(TerminationReport {
                phase: TerminationPhase::Killed,
                status,
            }),
            Ok(Err(e)) => Err(ShutdownError::TaskError(e.to_string())),
            Err(_) => {
                error!("Process did not exit even after kill");
                Err(ShutdownError::Unresponsive)
            }
        }
    }
}

/// Shutdown error types
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Task execution error: {0}")]
    TaskError(String),

    #[error("Shutdown already in progress")]
    AlreadyShuttingDown,

    #[error("Process unresponsive to termination")]
    Unresponsive,
}
