//! Request and response envelopes exchanged with workers

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::commands::Command;
use crate::error::IpcError;

/// Per-request token matched between a request and its response
///
/// Ids are allocated monotonically per channel, so a response carrying an id
/// lower than the one in flight is a leftover from an abandoned exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    /// The id following this one
    pub fn next(self) -> Self {
        CorrelationId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message sent from the pool to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: CorrelationId,
    pub command: String,
    #[serde(default = "empty_object")]
    pub args: JsonValue,
}

impl Request {
    pub fn new(id: CorrelationId, command: impl Into<String>, args: JsonValue) -> Self {
        Self {
            id,
            command: command.into(),
            args,
        }
    }

    /// Build a request for a declared command from its typed arguments
    pub fn for_command<C: Command>(id: CorrelationId, args: &C::Args) -> Result<Self, IpcError> {
        let args = serde_json::to_value(args)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        Ok(Self::new(id, C::NAME, args))
    }

    /// Decode the arguments as those of a declared command
    pub fn typed_args<C: Command>(&self) -> Result<C::Args, IpcError> {
        serde_json::from_value(self.args.clone())
            .map_err(|e| IpcError::InvalidMessage(format!("{} args: {}", C::NAME, e)))
    }
}

/// Message sent from a worker back to the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Seconds since the Unix epoch at which the worker produced the response
    #[serde(default)]
    pub timestamp: Option<f64>,
}

/// Error reported by the worker inside a well-formed response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub traceback: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RemoteError {}

impl Response {
    pub fn success(id: CorrelationId, result: JsonValue) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
            traceback: None,
            timestamp: Some(now_seconds()),
        }
    }

    pub fn error(id: CorrelationId, message: impl Into<String>, traceback: Option<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(message.into()),
            traceback,
            timestamp: Some(now_seconds()),
        }
    }

    /// Split into the worker's result or the worker's reported error
    pub fn into_result(self) -> Result<JsonValue, RemoteError> {
        if self.success {
            Ok(self.result.unwrap_or(JsonValue::Null))
        } else {
            Err(RemoteError {
                message: self
                    .error
                    .unwrap_or_else(|| "worker reported failure without a message".to_string()),
                traceback: self.traceback,
            })
        }
    }
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Default::default())
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
