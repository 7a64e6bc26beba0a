//! Reference worker speaking the pool protocol over stdin/stdout
//!
//! Serves the control commands plus a few commands that make pool behavior
//! observable from tests: `echo`, `sleep`, `fail`, `crash` and `session_hit`.
//! Flags make it misbehave on purpose (slow or failing handshakes, an exit
//! right after the handshake, ignored shutdown requests, probes that stop
//! being answered).

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Value as JsonValue};
use snakepit_ipc::{
    CleanupSession, CleanupSessionResponse, Command, GetStats, IpcError, IpcTransport, Ping,
    PingResponse, Request, Response, Shutdown, ShutdownResponse, StatsResponse, StdioTransport,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "snakepit-echo-worker")]
#[command(about = "Reference worker for the Snakepit pool")]
struct Cli {
    #[arg(long)]
    worker_id: Option<String>,

    /// Launch mode passed by the pool
    #[arg(long, default_value = "standalone")]
    mode: String,

    /// Delay every ping reply by this many milliseconds
    #[arg(long, default_value_t = 0)]
    handshake_delay_ms: u64,

    /// Answer ping with an error response
    #[arg(long)]
    fail_handshake: bool,

    /// Stop answering ping after this many replies
    #[arg(long)]
    hang_pings_after: Option<u64>,

    /// Exit this many milliseconds after the first answered ping
    #[arg(long)]
    exit_after_handshake_ms: Option<u64>,

    /// Keep running after `shutdown`, stdin EOF and SIGTERM
    #[arg(long)]
    ignore_shutdown: bool,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

struct Worker {
    id: String,
    mode: String,
    cli: Cli,
    started: Instant,
    command_count: u64,
    error_count: u64,
    pings_answered: u64,
    /// Requests seen per session
    sessions: HashMap<String, u64>,
}

enum Reply {
    Send(Response),
    /// Answer nothing; the pool's deadline decides
    Silent,
    SendAndExit(Response),
}

impl Worker {
    fn new(cli: Cli) -> Self {
        Self {
            id: cli
                .worker_id
                .clone()
                .unwrap_or_else(|| format!("standalone-{}", std::process::id())),
            mode: cli.mode.clone(),
            cli,
            started: Instant::now(),
            command_count: 0,
            error_count: 0,
            pings_answered: 0,
            sessions: HashMap::new(),
        }
    }

    async fn handle(&mut self, request: Request) -> Reply {
        self.command_count += 1;
        let id = request.id;
        let result = match request.command.as_str() {
            Ping::NAME => return self.ping(request).await,
            Shutdown::NAME => {
                let response = ShutdownResponse {
                    status: "shutting_down".into(),
                    worker_id: Some(self.id.clone()),
                };
                let response = Response::success(id, to_value(&response));
                if self.cli.ignore_shutdown {
                    warn!(worker_id = %self.id, "Ignoring shutdown request");
                    return Reply::Send(response);
                }
                return Reply::SendAndExit(response);
            }
            GetStats::NAME => {
                let stats = StatsResponse {
                    command_count: self.command_count,
                    error_count: self.error_count,
                    uptime: self.started.elapsed().as_secs_f64(),
                };
                let mut value = to_value(&stats);
                value["pid"] = json!(std::process::id());
                Ok(value)
            }
            CleanupSession::NAME => match request.typed_args::<CleanupSession>() {
                Ok(args) => {
                    let status = if self.sessions.remove(&args.session_id).is_some() {
                        "cleaned"
                    } else {
                        "unknown_session"
                    };
                    Ok(to_value(&CleanupSessionResponse {
                        status: status.into(),
                        session_id: Some(args.session_id),
                    }))
                }
                Err(e) => Err(e.to_string()),
            },
            "echo" => Ok(json!({
                "echo": request.args,
                "worker_id": self.id,
                "pid": std::process::id(),
            })),
            "sleep" => {
                let ms = request.args.get("ms").and_then(JsonValue::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms, "worker_id": self.id }))
            }
            "session_hit" => match request.args.get("session_id").and_then(JsonValue::as_str) {
                Some(session) => {
                    let hits = self.sessions.entry(session.to_string()).or_insert(0);
                    *hits += 1;
                    Ok(json!({ "session_id": session, "hits": *hits, "worker_id": self.id }))
                }
                None => Err("session_hit requires a session_id".to_string()),
            },
            "fail" => {
                let message = request
                    .args
                    .get("message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("requested failure")
                    .to_string();
                self.error_count += 1;
                return Reply::Send(Response::error(
                    id,
                    message,
                    Some(format!("Traceback:\n  worker {} command fail", self.id)),
                ));
            }
            "crash" => {
                error!(worker_id = %self.id, "Crashing on request");
                std::process::exit(1);
            }
            other => Err(format!("unknown command: {}", other)),
        };

        match result {
            Ok(value) => Reply::Send(Response::success(id, value)),
            Err(message) => {
                self.error_count += 1;
                Reply::Send(Response::error(id, message, None))
            }
        }
    }

    async fn ping(&mut self, request: Request) -> Reply {
        if self
            .cli
            .hang_pings_after
            .is_some_and(|limit| self.pings_answered >= limit)
        {
            debug!(worker_id = %self.id, "Leaving ping unanswered");
            return Reply::Silent;
        }
        if self.cli.handshake_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.cli.handshake_delay_ms)).await;
        }
        if self.cli.fail_handshake {
            self.error_count += 1;
            return Reply::Send(Response::error(request.id, "not ready", None));
        }
        self.pings_answered += 1;
        if let (1, Some(ms)) = (self.pings_answered, self.cli.exit_after_handshake_ms) {
            let worker_id = self.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                warn!(worker_id = %worker_id, "Exiting after handshake as requested");
                std::process::exit(0);
            });
        }

        let nonce = request.args.get("nonce").and_then(JsonValue::as_u64);
        let response = PingResponse {
            status: "ok".into(),
            nonce,
            worker_id: Some(self.id.clone()),
            uptime: Some(self.started.elapsed().as_secs_f64()),
            mode: Some(self.mode.clone()),
        };
        Reply::Send(Response::success(request.id, to_value(&response)))
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

#[cfg(unix)]
fn ignore_sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        while terminate.recv().await.is_some() {
            warn!("Ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_sigterm() -> Result<()> {
    Ok(())
}

async fn serve(mut worker: Worker) -> Result<()> {
    let mut transport = StdioTransport::new();
    info!(worker_id = %worker.id, mode = %worker.mode, "Worker started");

    loop {
        let request = match transport.receive::<Request>().await {
            Ok(request) => request,
            Err(IpcError::ConnectionClosed) => {
                info!(worker_id = %worker.id, "Stdin closed");
                if worker.cli.ignore_shutdown {
                    // Only a kill ends us now
                    std::future::pending::<()>().await;
                }
                break;
            }
            Err(e) if e.stream_usable() => {
                warn!(worker_id = %worker.id, "Skipping malformed message: {}", e);
                continue;
            }
            Err(e) => return Err(e).context("Failed to read request"),
        };

        debug!(worker_id = %worker.id, id = %request.id, command = %request.command, "Request");
        match worker.handle(request).await {
            Reply::Send(response) => transport
                .send(&response)
                .await
                .context("Failed to write response")?,
            Reply::Silent => {}
            Reply::SendAndExit(response) => {
                transport
                    .send(&response)
                    .await
                    .context("Failed to write response")?;
                info!(worker_id = %worker.id, "Shutting down on request");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    snakepit_logging::init_simple_tracing(&cli.log_level)?;

    if cli.ignore_shutdown {
        ignore_sigterm()?;
    }
    serve(Worker::new(cli)).await
}
