use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error as ThisError;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use crate::command::Command;
use crate::frame::{self, Frame};

const DEFAULT_PORT: u16 = 6379;

#[derive(Debug, Clone, ThisError)]
pub enum ConnectionError {
    #[error("io error; {0}")]
    Io(Arc<io::Error>),
    #[error("{0}")]
    Protocol(String),
    /// An error reply sent by the backend. It does not affect the connection.
    #[error("{}", String::from_utf8_lossy(.0))]
    Reply(Bytes),
    #[error("connection closed")]
    Closed,
    #[error("invalid backend url; {0}")]
    InvalidUrl(String),
}

impl ConnectionError {
    /// Whether the connection that produced this error is unusable from now on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionError::Reply(_))
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

impl From<frame::Error> for ConnectionError {
    fn from(err: frame::Error) -> Self {
        match err {
            frame::Error::Io(err) => ConnectionError::Io(Arc::new(err)),
            err => ConnectionError::Protocol(err.to_string()),
        }
    }
}

/// Where and how to connect to the backend.
#[derive(Clone, Debug)]
pub struct DialOptions {
    pub address: String,
    /// Sent with `AUTH` right after connecting.
    pub password: Option<String>,
    /// Sent with `SELECT` right after connecting, unless zero.
    pub database: i64,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_frame_size: usize,
}

impl DialOptions {
    pub fn new(address: impl Into<String>) -> DialOptions {
        DialOptions {
            address: address.into(),
            password: None,
            database: 0,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Parses `redis://[user][:password@]host[:port][/database]`.
    pub fn from_url(url: &str) -> Result<DialOptions, ConnectionError> {
        let invalid = |msg: String| ConnectionError::InvalidUrl(msg);

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid(format!("missing scheme in {}", url)))?;
        if scheme != "redis" {
            return Err(invalid(format!("invalid redis URL scheme: {}", scheme)));
        }

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (password, host_port) = match authority.rsplit_once('@') {
            Some((user_info, host_port)) => {
                let password = user_info
                    .split_once(':')
                    .map(|(_, password)| password.to_string())
                    .filter(|password| !password.is_empty());
                (password, host_port)
            }
            None => (None, authority),
        };

        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| invalid(format!("invalid port: {}", port)))?;
                (host, port)
            }
            _ => (host_port, DEFAULT_PORT),
        };
        let host = if host.is_empty() { "localhost" } else { host };

        let database = if path.is_empty() {
            0
        } else {
            path.parse::<i64>()
                .ok()
                .filter(|db| *db >= 0 && path.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| invalid(format!("invalid database: {}", path)))?
        };

        let mut opts = DialOptions::new(format!("{}:{}", host, port));
        opts.password = password;
        opts.database = database;
        Ok(opts)
    }
}

struct Io {
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

/// A single socket to the backend.
///
/// Commands are encoded into a local buffer by [`send`](Self::send) and only hit the network on
/// [`flush`](Self::flush). The number of replies owed by the backend is tracked so that
/// [`exec`](Self::exec) can skip past pipelined replies before returning its own.
///
/// The first I/O or protocol error is fatal: the socket is dropped and the error is kept, and
/// every later call returns it without touching the network.
pub struct BackendConnection {
    io: Option<Io>,
    write_buf: BytesMut,
    pending: usize,
    err: Option<ConnectionError>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl BackendConnection {
    pub async fn connect(opts: &DialOptions) -> Result<BackendConnection, ConnectionError> {
        let stream = match opts.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(&opts.address))
                .await
                .map_err(|_| ConnectionError::from(timed_out()))??,
            None => TcpStream::connect(&opts.address).await?,
        };
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        let mut conn = BackendConnection::new(stream, opts);

        if let Some(password) = opts.password.as_deref() {
            conn.exec(&Command::new("AUTH").arg(password)).await?;
        }
        if opts.database != 0 {
            conn.exec(&Command::new("SELECT").arg(opts.database)).await?;
        }

        debug!(address = %opts.address, "connected to backend");
        Ok(conn)
    }

    pub fn new(stream: TcpStream, opts: &DialOptions) -> BackendConnection {
        let (read_half, write_half) = stream.into_split();
        BackendConnection {
            io: Some(Io {
                reader: FramedRead::new(read_half, FrameCodec::new(opts.max_frame_size)),
                writer: write_half,
            }),
            write_buf: BytesMut::with_capacity(4096),
            pending: 0,
            err: None,
            read_timeout: opts.read_timeout,
            write_timeout: opts.write_timeout,
        }
    }

    /// The stored error, if the connection failed or was closed.
    pub fn err(&self) -> Option<ConnectionError> {
        self.err.clone()
    }

    /// Replies sent for but not read yet.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Buffers `cmd` without writing it to the socket.
    pub fn send(&mut self, cmd: &Command) -> Result<(), ConnectionError> {
        self.check()?;
        cmd.encode(&mut self.write_buf);
        self.pending += 1;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.check()?;
        if self.write_buf.is_empty() {
            return Ok(());
        }

        let result = match self.io.as_mut() {
            Some(io) => {
                let write = io.writer.write_all_buf(&mut self.write_buf);
                with_deadline(self.write_timeout, write).await
            }
            None => return Err(ConnectionError::Closed),
        };

        result.map_err(|err| self.fatal(err.into()))
    }

    /// Reads one reply. Error replies come back as [`ConnectionError::Reply`].
    pub async fn receive(&mut self) -> Result<Frame, ConnectionError> {
        let frame = self.read_reply().await?;
        self.pending = self.pending.saturating_sub(1);

        match frame {
            Frame::Error(msg) => Err(ConnectionError::Reply(msg)),
            frame => Ok(frame),
        }
    }

    /// Sends `cmd` and returns its reply, first reading the replies of anything sent before it.
    /// If any of those replies was an error, the first one is returned instead.
    pub async fn exec(&mut self, cmd: &Command) -> Result<Frame, ConnectionError> {
        self.check()?;
        cmd.encode(&mut self.write_buf);
        self.pending += 1;
        self.flush().await?;

        // `pending` only drops as replies arrive, so an exec cancelled halfway leaves the
        // connection visibly unfinished.
        let mut first_error = None;
        let mut reply = Frame::Null;
        while self.pending > 0 {
            reply = self.read_reply().await?;
            self.pending -= 1;
            if let Frame::Error(msg) = &reply {
                first_error.get_or_insert_with(|| msg.clone());
            }
        }

        match first_error {
            Some(msg) => Err(ConnectionError::Reply(msg)),
            None => Ok(reply),
        }
    }

    /// Flushes anything buffered and collects every pending reply, error replies included.
    pub async fn drain(&mut self) -> Result<Vec<Frame>, ConnectionError> {
        self.check()?;
        if self.pending == 0 && self.write_buf.is_empty() {
            return Ok(vec![]);
        }

        self.flush().await?;

        let mut replies = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            replies.push(self.read_reply().await?);
            self.pending -= 1;
        }
        Ok(replies)
    }

    /// Closes the socket. Idempotent; a fatal error stays the stored error.
    pub fn close(&mut self) {
        self.err.get_or_insert(ConnectionError::Closed);
        self.io = None;
    }

    fn check(&self) -> Result<(), ConnectionError> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn read_reply(&mut self) -> Result<Frame, ConnectionError> {
        self.check()?;
        let Some(io) = self.io.as_mut() else {
            return Err(ConnectionError::Closed);
        };

        let next = match self.read_timeout {
            Some(limit) => timeout(limit, io.reader.next()).await.ok(),
            None => Some(io.reader.next().await),
        };

        match next {
            Some(Some(Ok(frame))) => Ok(frame),
            Some(Some(Err(err))) => Err(self.fatal(err.into())),
            Some(None) => Err(self.fatal(
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by backend").into(),
            )),
            None => Err(self.fatal(timed_out().into())),
        }
    }

    fn fatal(&mut self, err: ConnectionError) -> ConnectionError {
        if self.err.is_none() {
            warn!(error = %err, "backend connection failed");
            self.err = Some(err.clone());
            // Dropping the socket makes every later operation fail fast.
            self.io = None;
        }
        err
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

async fn with_deadline<F, T>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut).await.unwrap_or_else(|_| Err(timed_out())),
        None => fut.await,
    }
}
