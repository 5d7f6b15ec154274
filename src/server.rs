use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument};

use crate::codec::{FrameCodec, ReplyFramer};
use crate::config::ProxyConfig;
use crate::connection::Connection;
use crate::filter::Filter;
use crate::pool::Pool;
use crate::session::Session;
use crate::Error;

/// Everything a session needs, shared by all sessions of one listener.
#[derive(Clone)]
pub struct Proxy {
    pub(crate) pool: Pool,
    pub(crate) filter: Arc<Filter>,
    pub(crate) framer: ReplyFramer,
    pub(crate) codec: FrameCodec,
}

impl Proxy {
    pub fn new(pool: Pool, filter: Filter, framer: ReplyFramer) -> Proxy {
        Proxy {
            pool,
            filter: Arc::new(filter),
            framer,
            codec: FrameCodec::default(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Proxy {
        Proxy {
            pool: Pool::with_dial_options(config.dial.clone(), config.pool.clone()),
            filter: Arc::new(config.filter.clone()),
            framer: ReplyFramer::new(config.framing, config.chunk_size),
            codec: FrameCodec::new(config.max_frame_size),
        }
    }

    /// Bounds the bytes buffered per client while waiting for a complete frame.
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Proxy {
        self.codec = FrameCodec::new(max_frame_size);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

pub async fn run(config: ProxyConfig, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
    let listener = TcpListener::bind(config.listen).await?;
    let proxy = Proxy::from_config(&config);

    serve(listener, proxy, shutdown).await
}

/// Accepts clients until `shutdown` completes, then closes the pool. Sessions still running
/// return their connections to the closed pool, which closes them.
pub async fn serve(
    listener: TcpListener,
    proxy: Proxy,
    shutdown: impl Future<Output = ()>,
) -> Result<(), Error> {
    info!("Proxy listening on {}", listener.local_addr()?);

    tokio::pin!(shutdown);

    loop {
        let (socket, client_address) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        };
        let proxy = proxy.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, proxy).await {
                error!(error = %e, "Connection ended with an error");
            }
        });
    }

    proxy.pool.close();
    Ok(())
}

#[instrument(
    name = "connection",
    skip(stream, proxy),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    proxy: Proxy,
) -> Result<(), Error> {
    let _ = stream.set_nodelay(true);
    let conn = Connection::with_codec(stream, proxy.codec.clone());

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    let mut session = Session::new(conn, proxy);
    session.run().await?;

    info!("Connection closed");
    Ok(())
}
