#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use rustdis_proxy::backend::DialOptions;
use rustdis_proxy::codec::FrameCodec;
use rustdis_proxy::command::Command;
use rustdis_proxy::frame::Frame;

#[derive(Default)]
struct Recorded {
    commands: Vec<String>,
    connections: usize,
    data: HashMap<String, Bytes>,
}

/// A scripted RESP server standing in for the backend. It answers a handful of commands and
/// records every command it receives.
///
/// Besides the usual data commands it understands `BIG <n>` (a bulk string of `n` bytes),
/// `LIST` (a two-element array), `HANG` (never replies) and `CRASH` (drops the connection).
pub struct FakeBackend {
    pub addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
}

impl FakeBackend {
    pub async fn start() -> FakeBackend {
        FakeBackend::with_password(None).await
    }

    pub async fn with_password(password: Option<&str>) -> FakeBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let password = password.map(str::to_string);

        let shared = recorded.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                shared.lock().unwrap().connections += 1;
                tokio::spawn(serve(socket, shared.clone(), password.clone()));
            }
        });

        FakeBackend { addr, recorded }
    }

    pub fn dial_options(&self) -> DialOptions {
        DialOptions::new(self.addr.to_string())
    }

    /// Every command received so far, as space separated text.
    pub fn commands(&self) -> Vec<String> {
        self.recorded.lock().unwrap().commands.clone()
    }

    pub fn received(&self, command: &str) -> bool {
        self.commands().iter().any(|c| c == command)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.recorded.lock().unwrap().connections
    }
}

async fn serve(socket: TcpStream, recorded: Arc<Mutex<Recorded>>, password: Option<String>) {
    let mut framed = Framed::new(socket, FrameCodec::default());
    let mut authenticated = password.is_none();

    while let Some(Ok(frame)) = framed.next().await {
        let Ok(cmd) = Command::try_from(frame) else {
            return;
        };
        let args: Vec<String> = cmd
            .args()
            .iter()
            .map(|a| String::from_utf8_lossy(a).to_string())
            .collect();
        let name = cmd.normalized_name();
        recorded.lock().unwrap().commands.push(cmd.to_string());

        if !authenticated && name != "AUTH" {
            let reply = Frame::Error(Bytes::from("NOAUTH Authentication required."));
            if framed.send(reply).await.is_err() {
                return;
            }
            continue;
        }

        let replies = match name.as_str() {
            "CRASH" => return,
            "HANG" => continue,
            "AUTH" => {
                if password.as_deref() == args.first().map(String::as_str) {
                    authenticated = true;
                    vec![ok()]
                } else {
                    vec![Frame::Error(Bytes::from("WRONGPASS invalid password"))]
                }
            }
            "PING" => vec![Frame::Simple(Bytes::from("PONG"))],
            "ECHO" => vec![bulk(&args[0])],
            "SELECT" | "MULTI" | "DISCARD" | "WATCH" | "UNWATCH" => vec![ok()],
            "EXEC" => vec![Frame::Array(vec![])],
            "SET" => {
                let value = Bytes::from(args[1].clone());
                recorded.lock().unwrap().data.insert(args[0].clone(), value);
                vec![ok()]
            }
            "GET" => {
                let value = recorded.lock().unwrap().data.get(&args[0]).cloned();
                vec![value.map(Frame::Bulk).unwrap_or(Frame::Null)]
            }
            "INCR" => incr(&recorded, &args[0]),
            "BIG" => {
                let len: usize = args[0].parse().unwrap();
                vec![Frame::Bulk(Bytes::from(vec![b'x'; len]))]
            }
            "LIST" => vec![Frame::Array(vec![bulk("a"), bulk("b")])],
            "SUBSCRIBE" => {
                let channel = &args[0];
                vec![
                    Frame::Array(vec![bulk("subscribe"), bulk(channel), Frame::Integer(1)]),
                    // Published while the client was busy; arrives before any later reply.
                    Frame::Array(vec![bulk("message"), bulk(channel), bulk("hello")]),
                ]
            }
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => vec![Frame::Array(vec![
                bulk(&name.to_lowercase()),
                Frame::Null,
                Frame::Integer(0),
            ])],
            // Echoes the raw name back, whatever its encoding.
            _ => vec![Frame::Error(
                [&b"ERR unknown command '"[..], &cmd.name()[..], &b"'"[..]].concat().into(),
            )],
        };

        for reply in replies {
            if framed.feed(reply).await.is_err() {
                return;
            }
        }
        if SinkExt::<Frame>::flush(&mut framed).await.is_err() {
            return;
        }
    }
}

fn incr(recorded: &Mutex<Recorded>, key: &str) -> Vec<Frame> {
    let mut recorded = recorded.lock().unwrap();
    let current = match recorded.data.get(key) {
        Some(value) => match std::str::from_utf8(value).ok().and_then(|v| v.parse::<i64>().ok()) {
            Some(n) => n,
            None => {
                return vec![Frame::Error(
                    Bytes::from("ERR value is not an integer or out of range"),
                )]
            }
        },
        None => 0,
    };
    let next = current + 1;
    recorded
        .data
        .insert(key.to_string(), Bytes::from(next.to_string()));
    vec![Frame::Integer(next)]
}

fn ok() -> Frame {
    Frame::Simple(Bytes::from("OK"))
}

fn bulk(s: &str) -> Frame {
    Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}
