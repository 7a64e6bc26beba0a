//! Worker process lifecycle
//!
//! A worker is spawned with piped stdio, handshaken with a `ping`, and then
//! watched by a monitor task that owns the [`Child`]. The monitor reports an
//! abrupt exit to the coordinator and carries out forced termination when
//! asked to, so the process never outlives its record.

use serde::Serialize;
use snakepit_config::WorkerLaunchConfig;
use snakepit_ipc::{ChildProcessTransport, EmptyArgs, Shutdown};
use snakepit_resilience::{ProcessShutdownManager, TerminationPhase};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::WorkerChannel;
use crate::error::{InitializationFailure, PoolError};
use crate::handle::PoolEvent;

/// Stable identifier of one worker instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a worker occupying `slot`
    pub(crate) fn generate(slot: usize) -> Self {
        let unique = Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}-{}", slot, &unique[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Initializing,
    Ready,
    Busy,
    Unhealthy,
    Terminating,
    Terminated,
}

impl WorkerState {
    /// Whether the lifecycle graph has an edge from `self` to `next`
    ///
    /// Ready and Busy may jump straight to Terminated only when the process
    /// died on its own; every orderly exit passes through Terminating.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Initializing, Ready)
                | (Initializing, Terminating)
                | (Initializing, Terminated)
                | (Ready, Busy)
                | (Busy, Ready)
                | (Ready, Unhealthy)
                | (Busy, Unhealthy)
                | (Ready, Terminating)
                | (Ready, Terminated)
                | (Busy, Terminated)
                | (Unhealthy, Terminating)
                | (Unhealthy, Terminated)
                | (Terminating, Terminated)
        )
    }

    /// Counts toward the live worker total
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Initializing => "initializing",
            WorkerState::Ready => "ready",
            WorkerState::Busy => "busy",
            WorkerState::Unhealthy => "unhealthy",
            WorkerState::Terminating => "terminating",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Apply a lifecycle transition, refusing edges outside the graph
pub(crate) fn transition(
    worker_id: &WorkerId,
    state: &mut WorkerState,
    next: WorkerState,
) -> bool {
    if !state.can_transition_to(next) {
        error!(worker_id = %worker_id, "Refusing worker transition {} -> {}", state, next);
        return false;
    }
    debug!(worker_id = %worker_id, "Worker {} -> {}", state, next);
    *state = next;
    true
}

/// Handle on the monitor task that owns a worker's process
pub(crate) struct ProcessMonitor {
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<Duration>>,
    exited: watch::Receiver<bool>,
}

impl ProcessMonitor {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Wait up to `within` for the process to exit
    pub(crate) async fn wait_exit(&mut self, within: Duration) -> bool {
        let exited = timeout(within, self.exited.wait_for(|exited| *exited))
            .await
            .is_ok();
        exited || self.has_exited()
    }

    /// Ask the monitor to SIGTERM the process, then kill it after `grace`
    pub(crate) fn request_terminate(&mut self, grace: Duration) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(grace);
        }
    }
}

/// A worker that completed its handshake
pub(crate) struct SpawnedWorker {
    pub id: WorkerId,
    pub slot: usize,
    pub channel: WorkerChannel,
    pub monitor: ProcessMonitor,
}

/// Spawn a worker process for `slot` and wait for its handshake
pub(crate) async fn spawn_worker(
    slot: usize,
    launch: &WorkerLaunchConfig,
    events: mpsc::UnboundedSender<PoolEvent>,
) -> Result<SpawnedWorker, InitializationFailure> {
    let id = WorkerId::generate(slot);
    debug!(worker_id = %id, slot, "Spawning worker: {} {:?}", launch.command, launch.args);

    let mut command = Command::new(&launch.command);
    command
        .args(&launch.args)
        .arg("--mode")
        .arg("pool-worker")
        .arg("--worker-id")
        .arg(id.as_str())
        .envs(&launch.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = &launch.working_dir {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|e| InitializationFailure::Spawn {
        worker_id: id.clone(),
        reason: e.to_string(),
        retryable: e.kind() != std::io::ErrorKind::NotFound
            && e.kind() != std::io::ErrorKind::PermissionDenied,
    })?;

    let stdin = child.stdin.take().ok_or_else(|| InitializationFailure::Spawn {
        worker_id: id.clone(),
        reason: "stdin not captured".to_string(),
        retryable: false,
    })?;
    let stdout = child.stdout.take().ok_or_else(|| InitializationFailure::Spawn {
        worker_id: id.clone(),
        reason: "stdout not captured".to_string(),
        retryable: false,
    })?;

    let transport = ChildProcessTransport::with_max_frame_bytes(stdin, stdout, launch.max_frame_bytes);
    let mut channel = WorkerChannel::new(id.clone(), transport);
    let mut monitor = start_monitor(id.clone(), child, events);

    match channel.probe(launch.handshake_timeout).await {
        Ok(pong) => {
            info!(
                worker_id = %id,
                slot,
                pid = ?monitor.pid(),
                "Worker ready (status: {})",
                pong.status
            );
            Ok(SpawnedWorker {
                id,
                slot,
                channel,
                monitor,
            })
        }
        Err(e) => {
            warn!(worker_id = %id, slot, "Handshake failed: {}", e);
            channel.close();
            monitor.request_terminate(Duration::from_millis(100));
            monitor.wait_exit(Duration::from_secs(2)).await;
            Err(match e {
                PoolError::OperationTimeout { .. } => InitializationFailure::HandshakeTimeout {
                    worker_id: id,
                    timeout: launch.handshake_timeout,
                },
                other => InitializationFailure::HandshakeFailed {
                    worker_id: id,
                    reason: other.to_string(),
                },
            })
        }
    }
}

fn start_monitor(
    worker_id: WorkerId,
    child: Child,
    events: mpsc::UnboundedSender<PoolEvent>,
) -> ProcessMonitor {
    let pid = child.id();
    let (terminate_tx, terminate_rx) = oneshot::channel();
    let (exited_tx, exited) = watch::channel(false);
    tokio::spawn(monitor_process(worker_id, child, terminate_rx, exited_tx, events));
    ProcessMonitor {
        pid,
        terminate_tx: Some(terminate_tx),
        exited,
    }
}

enum MonitorOutcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Terminate(Duration),
    Abandoned,
}

async fn monitor_process(
    worker_id: WorkerId,
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<Duration>,
    exited_tx: watch::Sender<bool>,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let outcome = tokio::select! {
        status = child.wait() => MonitorOutcome::Exited(status),
        request = &mut terminate_rx => match request {
            Ok(grace) => MonitorOutcome::Terminate(grace),
            Err(_) => MonitorOutcome::Abandoned,
        },
    };

    match outcome {
        MonitorOutcome::Exited(status) => {
            let reason = match status {
                Ok(status) => format!("process exited with {}", status),
                Err(e) => format!("failed to wait for process: {}", e),
            };
            debug!(worker_id = %worker_id, "Worker {}", reason);
            exited_tx.send_replace(true);
            // Unknown ids are ignored, so exits after a requested shutdown are harmless
            let _ = events.send(PoolEvent::ProcessExited { worker_id, reason });
        }
        MonitorOutcome::Terminate(grace) => {
            match ProcessShutdownManager::shutdown_process(&mut child, grace).await {
                Ok(report) if report.phase == TerminationPhase::Killed => {
                    warn!(worker_id = %worker_id, "Worker killed after ignoring SIGTERM");
                }
                Ok(report) => {
                    debug!(worker_id = %worker_id, "Worker stopped ({:?}, {})", report.phase, report.status);
                }
                Err(e) => error!(worker_id = %worker_id, "Failed to stop worker: {}", e),
            }
            exited_tx.send_replace(true);
        }
        MonitorOutcome::Abandoned => {
            if let Err(e) = child.start_kill() {
                debug!(worker_id = %worker_id, "Kill of abandoned worker failed: {}", e);
            }
            let _ = child.wait().await;
            exited_tx.send_replace(true);
        }
    }
}

/// Take a worker down: `shutdown` command, closed stdin, SIGTERM, SIGKILL
///
/// Each step waits up to `shutdown_timeout` before escalating.
pub(crate) async fn terminate_worker(
    worker_id: WorkerId,
    channel: Option<WorkerChannel>,
    mut monitor: ProcessMonitor,
    shutdown_timeout: Duration,
) {
    if let Some(mut channel) = channel {
        if !channel.is_poisoned() && !monitor.has_exited() {
            match channel
                .call_command::<Shutdown>(&EmptyArgs {}, shutdown_timeout)
                .await
            {
                Ok(ack) => debug!(worker_id = %worker_id, "Shutdown acknowledged ({})", ack.status),
                Err(e) => debug!(worker_id = %worker_id, "Shutdown not acknowledged: {}", e),
            }
        }
        channel.close();
    }

    if monitor.wait_exit(shutdown_timeout).await {
        info!(worker_id = %worker_id, "Worker terminated");
        return;
    }

    warn!(worker_id = %worker_id, "Worker still running after {:?}; signalling", shutdown_timeout);
    monitor.request_terminate(shutdown_timeout);
    let bound = shutdown_timeout
        .saturating_mul(2)
        .saturating_add(Duration::from_secs(1));
    if monitor.wait_exit(bound).await {
        info!(worker_id = %worker_id, "Worker terminated after signal");
    } else {
        error!(worker_id = %worker_id, pid = ?monitor.pid(), "Worker did not exit after kill");
    }
}
