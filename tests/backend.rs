mod common;

use std::time::Duration;

use bytes::Bytes;
use common::FakeBackend;
use rustdis_proxy::backend::{BackendConnection, ConnectionError};
use rustdis_proxy::command::Command;
use rustdis_proxy::frame::Frame;

#[tokio::test]
async fn test_exec_round_trip() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    let set = conn.exec(&Command::new("SET").arg("key").arg("value")).await;
    let get = conn.exec(&Command::new("GET").arg("key")).await;
    let missing = conn.exec(&Command::new("GET").arg("other")).await;

    assert_eq!(set.unwrap(), Frame::Simple(Bytes::from("OK")));
    assert_eq!(get.unwrap(), Frame::Bulk(Bytes::from("value")));
    assert_eq!(missing.unwrap(), Frame::Null);
}

#[tokio::test]
async fn test_exec_reads_past_pipelined_replies() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    conn.send(&Command::new("INCR").arg("n")).unwrap();
    conn.send(&Command::new("INCR").arg("n")).unwrap();
    assert_eq!(conn.pending(), 2);

    let reply = conn.exec(&Command::new("INCR").arg("n")).await.unwrap();

    assert_eq!(reply, Frame::Integer(3));
    assert_eq!(conn.pending(), 0);
}

#[tokio::test]
async fn test_send_flush_receive() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    conn.send(&Command::new("PING")).unwrap();
    conn.send(&Command::new("ECHO").arg("hi")).unwrap();
    conn.flush().await.unwrap();

    assert_eq!(
        conn.receive().await.unwrap(),
        Frame::Simple(Bytes::from("PONG"))
    );
    assert_eq!(conn.receive().await.unwrap(), Frame::Bulk(Bytes::from("hi")));
    assert_eq!(conn.pending(), 0);
}

#[tokio::test]
async fn test_error_reply_is_not_fatal() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    conn.exec(&Command::new("SET").arg("k").arg("text"))
        .await
        .unwrap();
    let err = conn.exec(&Command::new("INCR").arg("k")).await.unwrap_err();

    assert!(matches!(&err, ConnectionError::Reply(msg) if msg.starts_with(b"ERR value is not")));
    assert!(!err.is_fatal());
    assert!(conn.err().is_none());
    assert_eq!(
        conn.exec(&Command::new("PING")).await.unwrap(),
        Frame::Simple(Bytes::from("PONG"))
    );
}

#[tokio::test]
async fn test_exec_reports_first_pipelined_error() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    conn.send(&Command::new("NOPE")).unwrap();
    conn.send(&Command::new("ALSONOPE")).unwrap();
    let err = conn.exec(&Command::new("PING")).await.unwrap_err();

    assert!(matches!(err, ConnectionError::Reply(msg) if msg == "ERR unknown command 'NOPE'"));
    assert_eq!(conn.pending(), 0);
}

#[tokio::test]
async fn test_non_utf8_error_reply_is_not_fatal() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    let err = conn.exec(&Command::new(&b"\xff"[..])).await.unwrap_err();

    assert!(matches!(
        &err,
        ConnectionError::Reply(msg) if msg[..] == b"ERR unknown command '\xff'"[..]
    ));
    assert!(!err.is_fatal());
    assert!(conn.err().is_none());
    assert_eq!(
        conn.exec(&Command::new("PING")).await.unwrap(),
        Frame::Simple(Bytes::from("PONG"))
    );
}

#[tokio::test]
async fn test_drain_collects_pending_replies() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    assert!(conn.drain().await.unwrap().is_empty());

    conn.send(&Command::new("PING")).unwrap();
    conn.send(&Command::new("NOPE")).unwrap();
    let replies = conn.drain().await.unwrap();

    assert_eq!(
        replies,
        vec![
            Frame::Simple(Bytes::from("PONG")),
            Frame::Error(Bytes::from("ERR unknown command 'NOPE'")),
        ]
    );
}

#[tokio::test]
async fn test_fatal_error_fails_fast() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    let first = conn.exec(&Command::new("CRASH")).await.unwrap_err();
    assert!(first.is_fatal());
    let seen = backend.commands().len();

    let send = conn.send(&Command::new("PING")).unwrap_err();
    let receive = conn.receive().await.unwrap_err();
    let exec = conn.exec(&Command::new("PING")).await.unwrap_err();

    for err in [send, receive, exec] {
        assert_eq!(err.to_string(), first.to_string());
    }
    assert_eq!(conn.err().unwrap().to_string(), first.to_string());
    assert_eq!(backend.commands().len(), seen);
}

#[tokio::test]
async fn test_read_timeout_is_fatal() {
    let backend = FakeBackend::start().await;
    let mut opts = backend.dial_options();
    opts.read_timeout = Some(Duration::from_millis(100));
    let mut conn = BackendConnection::connect(&opts).await.unwrap();

    let err = conn.exec(&Command::new("HANG")).await.unwrap_err();

    assert!(matches!(&err, ConnectionError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut));
    assert!(conn.err().is_some());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let backend = FakeBackend::start().await;
    let mut conn = BackendConnection::connect(&backend.dial_options())
        .await
        .unwrap();

    conn.close();
    conn.close();

    assert!(matches!(conn.err(), Some(ConnectionError::Closed)));
    assert!(matches!(
        conn.exec(&Command::new("PING")).await,
        Err(ConnectionError::Closed)
    ));
}

#[tokio::test]
async fn test_connect_authenticates_and_selects() {
    let backend = FakeBackend::with_password(Some("secret")).await;
    let mut opts = backend.dial_options();
    opts.password = Some("secret".to_string());
    opts.database = 2;

    let mut conn = BackendConnection::connect(&opts).await.unwrap();
    let reply = conn.exec(&Command::new("PING")).await.unwrap();

    assert_eq!(reply, Frame::Simple(Bytes::from("PONG")));
    assert_eq!(backend.commands()[..2], ["AUTH secret", "SELECT 2"]);
}

#[tokio::test]
async fn test_connect_fails_on_wrong_password() {
    let backend = FakeBackend::with_password(Some("secret")).await;
    let mut opts = backend.dial_options();
    opts.password = Some("wrong".to_string());

    let err = BackendConnection::connect(&opts).await.err().unwrap();

    assert!(matches!(err, ConnectionError::Reply(msg) if msg.starts_with(b"WRONGPASS")));
}

#[tokio::test]
async fn test_connect_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let opts = rustdis_proxy::backend::DialOptions::new(addr.to_string());
    let err = BackendConnection::connect(&opts).await.err().unwrap();

    assert!(matches!(err, ConnectionError::Io(_)));
}

#[tokio::test]
async fn test_connect_timeout_bounds_the_dial() {
    // Not routable, so the handshake never completes.
    let mut opts = rustdis_proxy::backend::DialOptions::new("10.255.255.1:6379");
    opts.connect_timeout = Some(Duration::from_millis(100));

    let dial = tokio::time::timeout(Duration::from_secs(5), BackendConnection::connect(&opts));
    let err = dial.await.expect("connect_timeout was not applied").err().unwrap();

    assert!(matches!(err, ConnectionError::Io(_)));
}

#[tokio::test]
async fn test_write_timeout_is_fatal() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut opts = rustdis_proxy::backend::DialOptions::new(listener.local_addr().unwrap().to_string());
    opts.write_timeout = Some(Duration::from_millis(100));

    // Accepts but never reads, so the socket buffers fill up.
    let peer = tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        std::future::pending::<()>().await;
    });

    let mut conn = BackendConnection::connect(&opts).await.unwrap();
    let big = vec![b'x'; 64 * 1024 * 1024];
    let err = conn
        .exec(&Command::new("SET").arg("k").arg(big))
        .await
        .unwrap_err();

    assert!(matches!(&err, ConnectionError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut));
    assert!(conn.err().is_some());
    peer.abort();
}
