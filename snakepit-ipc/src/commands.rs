//! Declarative command table
//!
//! A command pairs a wire name with typed argument and response structs.
//! Tables are declared with [`declare_commands!`](crate::declare_commands);
//! the pool's own control commands are declared below.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A command understood by workers
pub trait Command {
    /// Name sent in the `command` field
    const NAME: &'static str;
    /// Typed `args` payload
    type Args: Serialize + DeserializeOwned + Send + Sync;
    /// Typed `result` payload of a successful response
    type Response: Serialize + DeserializeOwned + Send;
}

/// Declare a table of commands
///
/// ```
/// use snakepit_ipc::{declare_commands, Command, EmptyArgs};
///
/// declare_commands! {
///     table PREDICT_COMMANDS;
///     /// Run a prediction
///     Predict => "predict" (serde_json::Value) -> serde_json::Value;
///     Reset => "reset_state" (EmptyArgs) -> serde_json::Value;
/// }
///
/// assert_eq!(Predict::NAME, "predict");
/// assert_eq!(PREDICT_COMMANDS, &["predict", "reset_state"]);
/// ```
#[macro_export]
macro_rules! declare_commands {
    (
        table $table:ident;
        $( $(#[$meta:meta])* $ty:ident => $name:literal ($args:ty) -> $resp:ty; )+
    ) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
            pub struct $ty;

            impl $crate::commands::Command for $ty {
                const NAME: &'static str = $name;
                type Args = $args;
                type Response = $resp;
            }
        )+

        /// Wire names of every command in this table
        pub const $table: &[&str] = &[$($name),+];
    };
}

/// Arguments of commands that take none
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyArgs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {
    /// Echoed back so a probe cannot be satisfied by a stale response
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub uptime: Option<f64>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub status: String,
    #[serde(default)]
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(default)]
    pub command_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub uptime: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSessionArgs {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSessionResponse {
    pub status: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

declare_commands! {
    table CONTROL_COMMANDS;
    /// Handshake and health probe
    Ping => "ping" (PingArgs) -> PingResponse;
    /// Graceful termination; the worker acknowledges then exits
    Shutdown => "shutdown" (EmptyArgs) -> ShutdownResponse;
    /// Command counters and uptime
    GetStats => "get_stats" (EmptyArgs) -> StatsResponse;
    /// Drop worker-local state held for a session
    CleanupSession => "cleanup_session" (CleanupSessionArgs) -> CleanupSessionResponse;
}
