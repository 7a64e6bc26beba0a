//! Inter-process communication for Snakepit
//!
//! Frames are a 4-byte big-endian length followed by UTF-8 JSON. The pool side
//! speaks through [`ChildProcessTransport`]; a worker implementation speaks
//! through [`StdioTransport`].

pub mod codec;
pub mod commands;
pub mod error;
pub mod protocol;
pub mod transport;

pub use codec::{read_frame, read_message, write_frame, write_message, DEFAULT_MAX_FRAME_BYTES};
pub use commands::{
    CleanupSession, CleanupSessionArgs, CleanupSessionResponse, Command, EmptyArgs, GetStats,
    Ping, PingArgs, PingResponse, Shutdown, ShutdownResponse, StatsResponse, CONTROL_COMMANDS,
};
pub use error::IpcError;
pub use protocol::{CorrelationId, RemoteError, Request, Response};
pub use transport::{ChildProcessTransport, IpcTransport, StdioTransport};
