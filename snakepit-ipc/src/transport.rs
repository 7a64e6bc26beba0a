//! IPC transport implementations

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{ChildStdin, ChildStdout};

use crate::codec::{read_message, write_message, DEFAULT_MAX_FRAME_BYTES};
use crate::error::IpcError;

/// IPC transport trait for different communication mechanisms
#[async_trait]
pub trait IpcTransport: Send {
    /// Send a message to the other end
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), IpcError>;

    /// Receive a message from the other end
    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<T, IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Stdin/Stdout transport used by the worker side of the protocol
pub struct StdioTransport {
    stdin: BufReader<tokio::io::Stdin>,
    stdout: BufWriter<tokio::io::Stdout>,
    max_frame_bytes: usize,
}

impl StdioTransport {
    /// Create a new stdio transport
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            stdin: BufReader::new(tokio::io::stdin()),
            stdout: BufWriter::new(tokio::io::stdout()),
            max_frame_bytes,
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpcTransport for StdioTransport {
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), IpcError> {
        write_message(&mut self.stdout, message).await
    }

    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<T, IpcError> {
        read_message(&mut self.stdin, self.max_frame_bytes).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Stdin/stdout are closed by process exit
        Ok(())
    }
}

/// Pool-side transport over a child process's piped stdin/stdout
///
/// The reader is buffered for the lifetime of the transport, so bytes that
/// arrive ahead of the current frame are never lost between receives.
pub struct ChildProcessTransport {
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    max_frame_bytes: usize,
}

impl ChildProcessTransport {
    /// Create a new child process transport
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::with_max_frame_bytes(stdin, stdout, DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(
        stdin: ChildStdin,
        stdout: ChildStdout,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            max_frame_bytes,
        }
    }

    /// Drop the write half so the worker sees end-of-input
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            log::debug!("closed worker stdin");
        }
    }

    pub fn is_open(&self) -> bool {
        self.stdin.is_some() && self.stdout.is_some()
    }
}

#[async_trait]
impl IpcTransport for ChildProcessTransport {
    async fn send<T: Serialize + Send + Sync>(&mut self, message: &T) -> Result<(), IpcError> {
        let stdin = self.stdin.as_mut().ok_or(IpcError::NotConnected)?;
        write_message(stdin, message).await
    }

    async fn receive<T: DeserializeOwned + Send>(&mut self) -> Result<T, IpcError> {
        let max = self.max_frame_bytes;
        let stdout = self.stdout.as_mut().ok_or(IpcError::NotConnected)?;
        read_message(stdout, max).await
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        // Take ownership and drop to close
        self.close_stdin();
        let _ = self.stdout.take();
        Ok(())
    }
}
