//! One-shot execution: checkout, exchange, checkin

use serde_json::Value as JsonValue;
use snakepit_ipc::Command;
use std::time::Duration;

use crate::coordinator::Pool;
use crate::error::PoolResult;
use crate::handle::CheckinOutcome;

/// Per-call overrides of the configured timeouts
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    pub checkout_timeout: Option<Duration>,
    pub operation_timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = Some(timeout);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }
}

impl Pool {
    /// Run `command` on any available worker
    pub async fn execute(&self, command: &str, args: JsonValue) -> PoolResult<JsonValue> {
        self.execute_in_session(None, command, args, ExecuteOptions::default())
            .await
    }

    /// Run `command`, preferring the worker bound to `session_id`
    ///
    /// The worker is checked in healthy unless the exchange failed in a way
    /// that leaves it unusable (timeout, crash or protocol error). A remote
    /// error response is returned as [`PoolError::Worker`](crate::PoolError::Worker)
    /// and the worker stays in service.
    pub async fn execute_in_session(
        &self,
        session_id: Option<&str>,
        command: &str,
        args: JsonValue,
        options: ExecuteOptions,
    ) -> PoolResult<JsonValue> {
        let deadline = self.operation_deadline(&options);
        let mut handle = self.checkout(session_id, options.checkout_timeout).await?;
        let result = handle.call(command, args, deadline).await;
        self.checkin(handle, CheckinOutcome::for_result(&result));
        result
    }

    /// Typed form of [`execute_in_session`](Self::execute_in_session)
    pub async fn execute_command<C: Command>(
        &self,
        session_id: Option<&str>,
        args: &C::Args,
        options: ExecuteOptions,
    ) -> PoolResult<C::Response> {
        let deadline = self.operation_deadline(&options);
        let mut handle = self.checkout(session_id, options.checkout_timeout).await?;
        let result = handle.call_command::<C>(args, deadline).await;
        self.checkin(handle, CheckinOutcome::for_result(&result));
        result
    }

    fn operation_deadline(&self, options: &ExecuteOptions) -> Duration {
        options
            .operation_timeout
            .unwrap_or_else(|| self.config().read(|c| c.pool.operation_timeout))
    }
}
