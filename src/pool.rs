use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error as ThisError;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BackendConnection, ConnectionError, DialOptions};
use crate::command::{normalize, Command};
use crate::frame::Frame;

#[derive(Debug, Clone, ThisError)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("get on closed pool")]
    Closed,
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type DialFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<BackendConnection, ConnectionError>> + Send + Sync>;

/// Checks an idle connection before it is handed out again; an error discards it. The second
/// argument is how long the connection has been idle.
pub type TestOnBorrow =
    for<'a> fn(&'a mut BackendConnection, Duration) -> BoxFuture<'a, Result<(), ConnectionError>>;

/// Pings connections that have been idle for a minute or more.
pub fn ping_if_idle(
    conn: &mut BackendConnection,
    idle_for: Duration,
) -> BoxFuture<'_, Result<(), ConnectionError>> {
    async move {
        if idle_for < Duration::from_secs(60) {
            return Ok(());
        }
        conn.exec(&Command::new("PING")).await.map(|_| ())
    }
    .boxed()
}

#[derive(Clone)]
pub struct PoolConfig {
    /// Idle connections kept around; the least recently used one is closed past this.
    pub max_idle: usize,
    /// Connections open at once, idle or borrowed. Zero means no limit.
    pub max_active: usize,
    /// Idle connections older than this are closed. Zero means never.
    pub idle_timeout: Duration,
    /// Wait for a connection to be returned instead of failing when at `max_active`.
    pub wait: bool,
    pub test_on_borrow: Option<TestOnBorrow>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: 16,
            max_active: 0,
            idle_timeout: Duration::ZERO,
            wait: false,
            test_on_borrow: None,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("max_idle", &self.max_idle)
            .field("max_active", &self.max_active)
            .field("idle_timeout", &self.idle_timeout)
            .field("wait", &self.wait)
            .field("test_on_borrow", &self.test_on_borrow.is_some())
            .finish()
    }
}

struct IdleConn {
    conn: BackendConnection,
    returned_at: Instant,
}

struct State {
    // Most recently returned first.
    idle: VecDeque<IdleConn>,
    active: usize,
    closed: bool,
}

struct Shared {
    dial: DialFn,
    config: PoolConfig,
    state: Mutex<State>,
    // Signalled whenever a connection is returned or destroyed.
    available: Notify,
}

/// A bounded set of backend connections shared by every client session. Cloning is cheap and
/// yields a handle to the same pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Shared>,
}

enum Step<'a> {
    Retry,
    Dial,
    Wait(Notified<'a>),
}

impl Pool {
    pub fn new<F>(dial: F, config: PoolConfig) -> Pool
    where
        F: Fn() -> BoxFuture<'static, Result<BackendConnection, ConnectionError>>
            + Send
            + Sync
            + 'static,
    {
        Pool {
            inner: Arc::new(Shared {
                dial: Arc::new(dial),
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    active: 0,
                    closed: false,
                }),
                config,
                available: Notify::new(),
            }),
        }
    }

    pub fn with_dial_options(opts: DialOptions, config: PoolConfig) -> Pool {
        let opts = Arc::new(opts);
        Pool::new(
            move || {
                let opts = opts.clone();
                async move { BackendConnection::connect(&opts).await }.boxed()
            },
            config,
        )
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrows a connection: an idle one if any passes the health check, otherwise a freshly
    /// dialed one if the pool is below `max_active`.
    pub async fn get(&self) -> Result<PooledConnection, PoolError> {
        let conn = self.get_conn().await?;
        Ok(PooledConnection::new(self.clone(), conn))
    }

    /// Connections open right now, idle or borrowed.
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closes every idle connection and refuses further borrows. Borrowed connections are
    /// closed when they come back.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.active = state.active.saturating_sub(idle.len());
            for mut idle in idle {
                idle.conn.close();
            }
        }
        self.inner.available.notify_waiters();
    }

    async fn get_conn(&self) -> Result<BackendConnection, PoolError> {
        self.prune_stale();

        loop {
            while let Some(idle) = self.pop_idle() {
                let Some(test) = self.inner.config.test_on_borrow else {
                    return Ok(idle.conn);
                };

                let slot = Slot::new(self);
                let mut conn = idle.conn;
                match test(&mut conn, idle.returned_at.elapsed()).await {
                    Ok(()) => {
                        slot.keep();
                        return Ok(conn);
                    }
                    Err(err) => {
                        debug!(error = %err, "idle connection failed its health check");
                        conn.close();
                    }
                }
            }

            let step = {
                let mut state = self.lock();
                let max_active = self.inner.config.max_active;

                if state.closed {
                    return Err(PoolError::Closed);
                }

                if !state.idle.is_empty() {
                    Step::Retry
                } else if max_active == 0 || state.active < max_active {
                    state.active += 1;
                    Step::Dial
                } else if !self.inner.config.wait {
                    return Err(PoolError::Exhausted);
                } else {
                    // Created under the lock, so a return right after unlocking still wakes us.
                    Step::Wait(self.inner.available.notified())
                }
            };

            match step {
                Step::Retry => continue,
                Step::Dial => {
                    let slot = Slot::new(self);
                    return match (self.inner.dial)().await {
                        Ok(conn) => {
                            slot.keep();
                            Ok(conn)
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to dial backend");
                            Err(err.into())
                        }
                    };
                }
                Step::Wait(notified) => notified.await,
            }
        }
    }

    fn prune_stale(&self) {
        let timeout = self.inner.config.idle_timeout;
        if timeout.is_zero() {
            return;
        }

        let mut pruned = 0;
        {
            let mut state = self.lock();
            while state
                .idle
                .back()
                .is_some_and(|idle| idle.returned_at.elapsed() >= timeout)
            {
                if let Some(mut idle) = state.idle.pop_back() {
                    idle.conn.close();
                    state.active = state.active.saturating_sub(1);
                    pruned += 1;
                }
            }
        }

        if pruned > 0 {
            debug!(pruned, "closed stale idle connections");
        }
        for _ in 0..pruned {
            self.inner.available.notify_one();
        }
    }

    fn pop_idle(&self) -> Option<IdleConn> {
        self.lock().idle.pop_front()
    }

    fn release(&self) {
        {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.inner.available.notify_one();
    }

    fn put(&self, conn: BackendConnection, force_close: bool) {
        let healthy = conn.err().is_none();
        {
            let mut state = self.lock();

            let discard = if !state.closed && healthy && !force_close {
                state.idle.push_front(IdleConn {
                    conn,
                    returned_at: Instant::now(),
                });
                if state.idle.len() > self.inner.config.max_idle {
                    state.idle.pop_back().map(|idle| idle.conn)
                } else {
                    None
                }
            } else {
                Some(conn)
            };

            if let Some(mut conn) = discard {
                conn.close();
                state.active = state.active.saturating_sub(1);
            }
        }
        self.inner.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// One unit of the active count, held across an await. Unless kept, dropping it gives the unit
/// back, so a borrow cancelled mid-dial or mid-check does not shrink the pool.
struct Slot<'a> {
    pool: &'a Pool,
    armed: bool,
}

impl<'a> Slot<'a> {
    fn new(pool: &'a Pool) -> Slot<'a> {
        Slot { pool, armed: true }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release();
        }
    }
}

/// Server-side state a command leaves behind on the connection it ran on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionState(u8);

impl SessionState {
    pub const NONE: SessionState = SessionState(0);
    pub const WATCHING: SessionState = SessionState(1);
    pub const IN_MULTI: SessionState = SessionState(1 << 1);
    pub const SUBSCRIBED: SessionState = SessionState(1 << 2);
    pub const MONITORING: SessionState = SessionState(1 << 3);

    pub fn contains(self, other: SessionState) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: SessionState) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn apply(self, effect: StateEffect) -> SessionState {
        SessionState((self.0 | effect.set.0) & !effect.clear.0)
    }
}

impl BitOr for SessionState {
    type Output = SessionState;

    fn bitor(self, rhs: SessionState) -> SessionState {
        SessionState(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateEffect {
    pub set: SessionState,
    pub clear: SessionState,
}

impl StateEffect {
    const NONE: StateEffect = StateEffect {
        set: SessionState::NONE,
        clear: SessionState::NONE,
    };

    const fn set(state: SessionState) -> StateEffect {
        StateEffect {
            set: state,
            clear: SessionState::NONE,
        }
    }

    const fn clear(state: SessionState) -> StateEffect {
        StateEffect {
            set: SessionState::NONE,
            clear: state,
        }
    }

    pub fn of(name: &[u8]) -> StateEffect {
        match normalize(name).as_str() {
            "WATCH" => StateEffect::set(SessionState::WATCHING),
            "UNWATCH" => StateEffect::clear(SessionState::WATCHING),
            "MULTI" => StateEffect::set(SessionState::IN_MULTI),
            "EXEC" | "DISCARD" => {
                StateEffect::clear(SessionState(SessionState::IN_MULTI.0 | SessionState::WATCHING.0))
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => StateEffect::set(SessionState::SUBSCRIBED),
            "MONITOR" => StateEffect::set(SessionState::MONITORING),
            _ => StateEffect::NONE,
        }
    }
}

fn sentinel() -> &'static Bytes {
    static SENTINEL: OnceLock<Bytes> = OnceLock::new();
    SENTINEL.get_or_init(|| Bytes::from(Uuid::new_v4().simple().to_string()))
}

/// A connection borrowed from a [`Pool`].
///
/// Commands are tracked so that [`close`](Self::close) can undo transactions, watches and
/// subscriptions before the connection is reused by another client. A connection whose state
/// could not be cleared is closed instead of going back to the pool.
pub struct PooledConnection {
    pool: Pool,
    conn: Option<BackendConnection>,
    state: SessionState,
}

impl PooledConnection {
    fn new(pool: Pool, conn: BackendConnection) -> PooledConnection {
        PooledConnection {
            pool,
            conn: Some(conn),
            state: SessionState::NONE,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn err(&self) -> Option<ConnectionError> {
        match &self.conn {
            Some(conn) => conn.err(),
            None => Some(ConnectionError::Closed),
        }
    }

    pub async fn exec(&mut self, cmd: &Command) -> Result<Frame, ConnectionError> {
        self.track(cmd);
        self.conn_mut()?.exec(cmd).await
    }

    pub fn send(&mut self, cmd: &Command) -> Result<(), ConnectionError> {
        self.track(cmd);
        self.conn_mut()?.send(cmd)
    }

    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        self.conn_mut()?.flush().await
    }

    pub async fn receive(&mut self) -> Result<Frame, ConnectionError> {
        self.conn_mut()?.receive().await
    }

    /// Resets the connection's server-side state and hands it back to the pool.
    pub async fn close(mut self) {
        let mut state = self.state;
        // The connection stays in `self` until it is put back, so if this future is dropped
        // halfway, `Drop` still hands it to the pool, which closes it.
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        // Failures below surface through the connection's stored error, which makes the pool
        // close it.
        if state.contains(SessionState::IN_MULTI) {
            let _ = conn.send(&Command::new("DISCARD"));
            state.remove(SessionState::IN_MULTI | SessionState::WATCHING);
        } else if state.contains(SessionState::WATCHING) {
            let _ = conn.send(&Command::new("UNWATCH"));
            state.remove(SessionState::WATCHING);
        }

        if state.contains(SessionState::SUBSCRIBED) {
            let _ = conn.send(&Command::new("UNSUBSCRIBE"));
            let _ = conn.send(&Command::new("PUNSUBSCRIBE"));
            // Published messages may still be in flight; the echoed sentinel marks their end.
            let sentinel = sentinel();
            let _ = conn.send(&Command::new("ECHO").arg(sentinel));
            let _ = conn.flush().await;
            loop {
                match conn.receive().await {
                    Ok(Frame::Bulk(reply)) if &reply == sentinel => {
                        state.remove(SessionState::SUBSCRIBED);
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }

        let _ = conn.drain().await;

        if !state.is_empty() {
            debug!(?state, "closing connection with leftover session state");
        }
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn, !state.is_empty());
        }
    }

    fn track(&mut self, cmd: &Command) {
        self.state = self.state.apply(StateEffect::of(cmd.name()));
    }

    fn conn_mut(&mut self) -> Result<&mut BackendConnection, ConnectionError> {
        self.conn.as_mut().ok_or(ConnectionError::Closed)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // Dropped without `close`: there is no way to run the async cleanup, so only a
        // connection without state or unread replies can be reused.
        if let Some(conn) = self.conn.take() {
            let reusable = self.state.is_empty() && conn.pending() == 0;
            self.pool.put(conn, !reusable);
        }
    }
}
