use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::backend::{ConnectionError, DialOptions};
use crate::codec::{Framing, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::filter::Filter;
use crate::pool::{ping_if_idle, PoolConfig, TestOnBorrow};

const PORT: u16 = 6380;

#[derive(Parser, Debug)]
#[command(version, about = "A connection-pooling RESP proxy")]
pub struct Args {
    /// The address to listen on
    #[arg(long, env = "PROXY_BIND", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    /// The port to listen on
    #[arg(short, long, env = "PROXY_PORT", default_value_t = PORT)]
    pub port: u16,

    /// Backend server as redis://[:password@]host[:port][/db]
    #[arg(short, long, env = "BACKEND_URL", default_value = "redis://127.0.0.1:6379")]
    pub backend: String,

    /// Backend password, overrides the one in the URL
    #[arg(long, env = "BACKEND_PASSWORD")]
    pub password: Option<String>,

    /// Backend database, overrides the one in the URL
    #[arg(long)]
    pub db: Option<i64>,

    /// Backend connect timeout in milliseconds, 0 to wait forever
    #[arg(long, default_value_t = 0)]
    pub connect_timeout_ms: u64,

    /// Backend read timeout in milliseconds, 0 to wait forever
    #[arg(long, default_value_t = 0)]
    pub read_timeout_ms: u64,

    /// Backend write timeout in milliseconds, 0 to wait forever
    #[arg(long, default_value_t = 0)]
    pub write_timeout_ms: u64,

    /// Idle backend connections to keep
    #[arg(long, default_value_t = 16)]
    pub max_idle: usize,

    /// Backend connections open at once, 0 for no limit
    #[arg(long, default_value_t = 0)]
    pub max_active: usize,

    /// Close backend connections idle for this long, 0 to keep them forever
    #[arg(long, default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Wait for a free backend connection instead of failing when at --max-active
    #[arg(long)]
    pub wait: bool,

    /// PING backend connections idle for a minute or more before reusing them
    #[arg(long)]
    pub test_on_borrow: bool,

    /// Refuse this command in addition to the built-in list, may be repeated
    #[arg(long = "deny", value_name = "COMMAND")]
    pub deny: Vec<String>,

    /// How replies are written back to clients
    #[arg(long, value_enum, default_value_t = Framing::Chunked)]
    pub framing: Framing,

    /// Largest bulk string in a chunked reply
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Largest undecoded frame buffered per connection, in bytes
    #[arg(long, env = "MAX_FRAME_SIZE", default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    pub max_frame_size: usize,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Everything needed to run one proxy. Nothing here is global, so tests can run several
/// differently configured proxies side by side.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub dial: DialOptions,
    pub pool: PoolConfig,
    pub filter: Filter,
    pub framing: Framing,
    pub chunk_size: usize,
    pub max_frame_size: usize,
}

impl ProxyConfig {
    pub fn new(listen: SocketAddr, dial: DialOptions) -> ProxyConfig {
        ProxyConfig {
            listen,
            dial,
            pool: PoolConfig::default(),
            filter: Filter::default(),
            framing: Framing::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TryFrom<Args> for ProxyConfig {
    type Error = ConnectionError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let mut dial = DialOptions::from_url(&args.backend)?;
        if let Some(password) = args.password {
            dial.password = Some(password).filter(|p| !p.is_empty());
        }
        if let Some(db) = args.db {
            dial.database = db;
        }
        dial.connect_timeout = millis(args.connect_timeout_ms);
        dial.read_timeout = millis(args.read_timeout_ms);
        dial.write_timeout = millis(args.write_timeout_ms);
        dial.max_frame_size = args.max_frame_size;

        let pool = PoolConfig {
            max_idle: args.max_idle,
            max_active: args.max_active,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            wait: args.wait,
            test_on_borrow: args.test_on_borrow.then_some(ping_if_idle as TestOnBorrow),
        };

        let filter = args
            .deny
            .iter()
            .fold(Filter::default(), |filter, name| filter.deny(name));

        Ok(ProxyConfig {
            listen: SocketAddr::new(args.bind, args.port),
            dial,
            pool,
            filter,
            framing: args.framing,
            chunk_size: args.chunk_size,
            max_frame_size: args.max_frame_size,
        })
    }
}
