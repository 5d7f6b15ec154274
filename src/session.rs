use tracing::{debug, info, warn};

use crate::backend::ConnectionError;
use crate::command::Command;
use crate::connection::Connection;
use crate::filter::Verdict;
use crate::frame::{self, Frame};
use crate::server::Proxy;

/// Relays one client's commands to the backend, one at a time and in arrival order.
///
/// A backend connection is borrowed for each command and returned before the next one is read,
/// so an idle client never pins a pooled connection.
pub struct Session {
    conn: Connection,
    proxy: Proxy,
}

impl Session {
    pub fn new(conn: Connection, proxy: Proxy) -> Session {
        Session { conn, proxy }
    }

    /// Runs until the client disconnects. Bytes that cannot be decoded end the session with an
    /// error.
    pub async fn run(&mut self) -> Result<(), frame::Error> {
        while let Some(frame) = self.conn.read_frame().await? {
            let reply = self.handle(frame).await;
            self.conn.write_frame(&reply).await?;
        }
        Ok(())
    }

    async fn handle(&self, frame: Frame) -> Frame {
        let framer = &self.proxy.framer;

        let cmd = match Command::try_from(frame) {
            Ok(cmd) => cmd,
            Err(err) => {
                warn!(error = %err, "invalid command frame");
                return framer.error(format!("ERR {}", err));
            }
        };

        let name = cmd.normalized_name();
        debug!(command = %name, args = cmd.args().len(), "received command");

        if self.proxy.filter.check(cmd.name()) == Verdict::Rejected {
            info!(command = %name, "rejected command");
            return framer.rejected();
        }

        let mut handle = match self.proxy.pool.get().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to borrow a backend connection");
                return framer.error(format!("ERR {}", err));
            }
        };

        let result = handle.exec(&cmd).await;
        handle.close().await;

        match result {
            Ok(reply) => framer.reply(reply),
            Err(ConnectionError::Reply(msg)) => {
                debug!(command = %name, error = ?msg, "backend replied with an error");
                framer.error(msg)
            }
            Err(err) => {
                warn!(command = %name, error = %err, "backend connection failed");
                framer.error(format!("ERR {}", err))
            }
        }
    }
}
