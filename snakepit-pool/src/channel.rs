//! Framed request/response channel to one worker process

use serde_json::Value as JsonValue;
use snakepit_ipc::{
    ChildProcessTransport, Command, CorrelationId, IpcError, IpcTransport, Ping, PingArgs,
    PingResponse, Request, Response,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::worker::WorkerId;

/// Exclusive channel to a worker
///
/// Every request carries a fresh correlation id. A response with a lower id
/// is a leftover from an exchange that was abandoned and is dropped. An
/// exchange that does not complete cleanly poisons the channel; a poisoned
/// channel refuses further requests.
pub struct WorkerChannel {
    worker_id: WorkerId,
    transport: ChildProcessTransport,
    next_id: CorrelationId,
    poisoned: bool,
}

impl WorkerChannel {
    pub(crate) fn new(worker_id: WorkerId, transport: ChildProcessTransport) -> Self {
        Self {
            worker_id,
            transport,
            next_id: CorrelationId(1),
            poisoned: false,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Whether an exchange on this channel was abandoned midway
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Send `command` and wait up to `deadline` for its response
    ///
    /// A well-formed error response is returned as `Ok`; only transport
    /// failures and deadline overruns are errors, and both poison the channel.
    pub async fn request(
        &mut self,
        command: &str,
        args: JsonValue,
        deadline: Duration,
    ) -> Result<Response, PoolError> {
        if self.poisoned {
            return Err(PoolError::ChannelPoisoned {
                worker_id: self.worker_id.clone(),
            });
        }

        let id = self.next_id;
        self.next_id = id.next();
        let request = Request::new(id, command, args);

        // Cleared only once the matching response has been read in full
        self.poisoned = true;
        match timeout(deadline, self.exchange(&request)).await {
            Ok(Ok(response)) => {
                self.poisoned = false;
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(worker_id = %self.worker_id, correlation_id = %id, command, "Exchange failed: {}", e);
                Err(PoolError::from_ipc(&self.worker_id, e))
            }
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    correlation_id = %id,
                    command,
                    "No response within {:?}; channel poisoned",
                    deadline
                );
                Err(PoolError::OperationTimeout {
                    worker_id: self.worker_id.clone(),
                    after: deadline,
                })
            }
        }
    }

    /// Like [`request`](Self::request), with a remote error turned into `PoolError::Worker`
    pub async fn call(
        &mut self,
        command: &str,
        args: JsonValue,
        deadline: Duration,
    ) -> Result<JsonValue, PoolError> {
        self.request(command, args, deadline)
            .await?
            .into_result()
            .map_err(|remote| PoolError::Worker {
                message: remote.message,
                traceback: remote.traceback,
            })
    }

    /// Call a declared command with typed arguments and response
    pub async fn call_command<C: Command>(
        &mut self,
        args: &C::Args,
        deadline: Duration,
    ) -> Result<C::Response, PoolError> {
        let args = serde_json::to_value(args).map_err(|e| PoolError::Ipc {
            worker_id: self.worker_id.clone(),
            source: IpcError::SerializationError(e.to_string()),
        })?;
        let result = self.call(C::NAME, args, deadline).await?;
        serde_json::from_value(result).map_err(|e| PoolError::Ipc {
            worker_id: self.worker_id.clone(),
            source: IpcError::DeserializationError(format!("{} response: {}", C::NAME, e)),
        })
    }

    /// Send `ping` with a fresh nonce and check the echo
    ///
    /// A worker that does not echo nonces at all is accepted; a wrong nonce is not.
    pub async fn probe(&mut self, deadline: Duration) -> Result<PingResponse, PoolError> {
        let nonce: u64 = rand::random();
        let response = self
            .call_command::<Ping>(&PingArgs { nonce }, deadline)
            .await?;
        match response.nonce {
            Some(echoed) if echoed != nonce => Err(PoolError::Ipc {
                worker_id: self.worker_id.clone(),
                source: IpcError::InvalidMessage(format!(
                    "probe nonce mismatch: sent {}, got {}",
                    nonce, echoed
                )),
            }),
            _ => Ok(response),
        }
    }

    /// Close the worker's stdin, which a well-behaved worker treats as shutdown
    pub(crate) fn close(&mut self) {
        self.transport.close_stdin();
    }

    async fn exchange(&mut self, request: &Request) -> Result<Response, IpcError> {
        self.transport.send(request).await?;
        loop {
            let response: Response = self.transport.receive().await?;
            if response.id == request.id {
                return Ok(response);
            }
            if response.id < request.id {
                debug!(
                    worker_id = %self.worker_id,
                    correlation_id = %response.id,
                    "Discarding stale response while waiting for {}",
                    request.id
                );
                continue;
            }
            return Err(IpcError::InvalidMessage(format!(
                "response {} arrived for request {}",
                response.id, request.id
            )));
        }
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("worker_id", &self.worker_id)
            .field("next_id", &self.next_id)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::process::Stdio;
    use tokio::process::{Child, Command as ProcessCommand};

    /// A shell worker that answers every request with the canned frames in `script`
    fn spawn_sh(script: &str) -> (Child, WorkerChannel) {
        let mut child = ProcessCommand::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let transport = ChildProcessTransport::new(
            child.stdin.take().unwrap(),
            child.stdout.take().unwrap(),
        );
        (child, WorkerChannel::new(WorkerId::new("worker-0-sh"), transport))
    }

    #[tokio::test]
    async fn test_silent_worker_poisons_channel() {
        let (_child, mut channel) = spawn_sh("sleep 30");

        let err = channel
            .request("echo", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::OperationTimeout { .. }));
        assert!(channel.is_poisoned());

        let err = channel
            .request("echo", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::ChannelPoisoned { .. }));
        assert!(err.requires_eviction());
    }

    /// `printf` statement writing `json` as one frame
    fn printf_frame(json: &str) -> String {
        let len = (json.len() as u32).to_be_bytes();
        let prefix: String = len.iter().map(|b| format!("\\{:03o}", b)).collect();
        format!("printf '{}{}';", prefix, json)
    }

    #[tokio::test]
    async fn test_stale_response_is_discarded() {
        let script = format!(
            "{} {} sleep 30",
            printf_frame(r#"{"id":0,"success":true,"result":"stale"}"#),
            printf_frame(r#"{"id":1,"success":true,"result":"fresh"}"#)
        );
        let (_child, mut channel) = spawn_sh(&script);

        let result = channel
            .call("echo", json!({}), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(result, json!("fresh"));
        assert!(!channel.is_poisoned());
    }

    #[tokio::test]
    async fn test_error_response_keeps_channel_usable() {
        let script = format!(
            "{} sleep 30",
            printf_frame(r#"{"id":1,"success":false,"error":"bad input","traceback":"tb"}"#)
        );
        let (_child, mut channel) = spawn_sh(&script);

        let err = channel
            .call("echo", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            PoolError::Worker { message, traceback } => {
                assert_eq!(message, "bad input");
                assert_eq!(traceback.as_deref(), Some("tb"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!channel.is_poisoned());
    }

    #[tokio::test]
    async fn test_exited_worker_is_a_crash() {
        let (_child, mut channel) = spawn_sh("exit 0");

        let err = channel
            .request("echo", json!({}), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::WorkerCrash { .. }));
    }
}
