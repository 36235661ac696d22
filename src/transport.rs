//! The seam between a [`Connection`](crate::tokio::Connection) and the wire.
//!
//! A transport is a blocking, single-owner session with the server. It is
//! driven exclusively from a connection's worker thread. The default
//! implementation is [`sync::Conn`](crate::sync::Conn); anything else that
//! implements these traits (a proxy, a recorder, a test double) can be
//! plugged in through [`Connection::with_connector`](crate::tokio::Connection::with_connector).

use std::time::Duration;

use crate::error::Result;
use crate::notify::Notification;
use crate::opts::Opts;
use crate::pipeline::Batch;
use crate::row::QueryResult;

/// A live, authenticated session.
pub trait Transport: Send {
    /// Run `sql` with the simple query protocol. Multi-statement text yields
    /// one result per statement.
    ///
    /// A rejected statement fails with [`Error::Query`](crate::Error::Query).
    fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>>;

    /// Send every request of `batch` before one Sync and collect one result
    /// per request, in order.
    ///
    /// A rejected request fails the whole batch with
    /// [`Error::Pipeline`](crate::Error::Pipeline) carrying its index.
    fn run_batch(&mut self, batch: &Batch) -> Result<Vec<QueryResult>>;

    /// Wait up to `timeout` for asynchronous messages and buffer any
    /// notifications that arrive.
    fn poll(&mut self, timeout: Duration) -> Result<()>;

    /// Notifications buffered since the last call, in arrival order.
    fn take_notifications(&mut self) -> Vec<Notification>;

    /// A handle that can abort a blocked operation from another thread.
    fn interrupter(&self) -> Option<Box<dyn Interrupt>>;

    /// True once the session can no longer be used.
    fn is_broken(&self) -> bool;

    /// Say goodbye to the server and release the socket. Never fails.
    fn terminate(&mut self);
}

/// Opens transports.
pub trait Connect: Send + Sync {
    /// Open and authenticate a session.
    ///
    /// Implementations pass `on_socket` an [`Interrupt`] as soon as there is
    /// something to interrupt, so a close can abort a stalled handshake.
    fn connect(
        &self,
        opts: &Opts,
        on_socket: &dyn Fn(Box<dyn Interrupt>),
    ) -> Result<Box<dyn Transport>>;
}

/// Aborts whatever the owning transport is blocked on.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}
