//! Transport tests against a real child process
//!
//! `cat` echoes every frame back unchanged, which is enough to exercise the
//! piped transport end to end.

#![cfg(unix)]

use serde_json::json;
use snakepit_ipc::*;
use std::process::Stdio;
use tokio::process::Command;

fn spawn_cat() -> tokio::process::Child {
    Command::new("cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .unwrap()
}

#[tokio::test]
async fn test_child_transport_round_trip() {
    let mut child = spawn_cat();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut transport = ChildProcessTransport::new(stdin, stdout);

    for i in 0..3u64 {
        let request = Request::new(CorrelationId(i), "echo", json!({"i": i}));
        transport.send(&request).await.unwrap();
        let echoed: Request = transport.receive().await.unwrap();
        assert_eq!(echoed, request);
    }
}

#[tokio::test]
async fn test_back_to_back_frames_are_not_lost() {
    let mut child = spawn_cat();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut transport = ChildProcessTransport::new(stdin, stdout);

    let first = Request::new(CorrelationId(1), "a", json!({}));
    let second = Request::new(CorrelationId(2), "b", json!({}));
    transport.send(&first).await.unwrap();
    transport.send(&second).await.unwrap();

    let got_first: Request = transport.receive().await.unwrap();
    let got_second: Request = transport.receive().await.unwrap();
    assert_eq!(got_first.id, CorrelationId(1));
    assert_eq!(got_second.id, CorrelationId(2));
}

#[tokio::test]
async fn test_closing_stdin_ends_the_stream() {
    let mut child = spawn_cat();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut transport = ChildProcessTransport::new(stdin, stdout);

    transport.close_stdin();
    assert!(!transport.is_open());

    let err = transport.receive::<Request>().await.unwrap_err();
    assert!(matches!(err, IpcError::ConnectionClosed));

    let err = transport
        .send(&Request::new(CorrelationId(9), "ping", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::NotConnected));
}

#[tokio::test]
async fn test_oversized_reply_is_rejected() {
    let mut child = spawn_cat();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let mut transport = ChildProcessTransport::with_max_frame_bytes(stdin, stdout, 16);

    let big = Request::new(CorrelationId(1), "echo", json!({"payload": "x".repeat(64)}));
    transport.send(&big).await.unwrap();

    let err = transport.receive::<Request>().await.unwrap_err();
    assert!(matches!(err, IpcError::FrameTooLarge { max: 16, .. }));
}
