//! Asynchronous PostgreSQL connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::notify::{Callback, Notification, Outbox, spawn_delivery};
use crate::opts::Opts;
use crate::row::QueryResult;
use crate::statement::{MAX_NAME_LEN, validate_name};
use crate::sync::PgConnector;
use crate::transport::Connect;
use crate::value::Value;

use super::dispatcher::Dispatcher;
use super::session::{Phase, Session, Shared};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Observable state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected: never used yet, closed, or the last connect failed.
    Closed,
    /// Handshake in progress.
    Connecting,
    /// Connected with nothing in flight.
    Idle,
    /// At least one operation is queued or running.
    Busy,
    /// Connected, idle, and subscribed to at least one channel.
    Listening,
}

struct ConnInner {
    id: u64,
    dispatcher: Dispatcher,
    shared: Arc<Shared>,
    statement_timeout: Option<std::time::Duration>,
    outbox: OnceLock<Outbox>,
}

/// Counts an operation as in flight until dropped.
struct InFlight<'a>(&'a Shared);

impl<'a> InFlight<'a> {
    fn enter(shared: &'a Shared) -> Self {
        shared.enter();
        Self(shared)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// Asynchronous PostgreSQL connection.
///
/// The server session is opened lazily by the first operation and driven by a
/// dedicated worker thread; operations from any number of tasks are queued and
/// run one at a time in submission order. Cloning is cheap and yields another
/// handle to the same session.
///
/// ```no_run
/// # async fn demo() -> pgnx::Result<()> {
/// use pgnx::{Connection, Value};
///
/// let conn = Connection::new("postgres://postgres@localhost/postgres")?;
/// conn.prepare("get_user", "SELECT name FROM users WHERE id = $1").await?;
/// let result = conn.execute("get_user", &[Value::from(42)]).await?;
/// for row in &result {
///     let name: &str = row.get("name")?;
///     println!("{name}");
/// }
/// conn.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Create a connection. No I/O happens until the first operation.
    ///
    /// A single connection never opens more than one session, so the pool
    /// settings in `opts` (`pool_size` and friends) are ignored here; use
    /// [`Pool::new`](crate::tokio::Pool::new) to get a sized pool from the same
    /// connection string.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        Self::with_connector(opts.try_into()?, Arc::new(PgConnector))
    }

    /// Create a connection whose session is opened by `connector`.
    pub fn with_connector(opts: Opts, connector: Arc<dyn Connect>) -> Result<Self> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::default());
        let statement_timeout = opts.statement_timeout;
        let session = Session::new(id, opts, connector, Arc::clone(&shared));
        let dispatcher = Dispatcher::spawn(session)?;
        Ok(Self {
            inner: Arc::new(ConnInner {
                id,
                dispatcher,
                shared,
                statement_timeout,
                outbox: OnceLock::new(),
            }),
        })
    }

    /// Create a connection and complete the handshake before returning.
    pub async fn connect<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let conn = Self::new(opts)?;
        conn.open().await?;
        Ok(conn)
    }

    /// Process-unique connection ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return ConnectionState::Closed;
        }
        match shared.phase() {
            Phase::NotConnected => ConnectionState::Closed,
            Phase::Connecting => ConnectionState::Connecting,
            Phase::Ready if shared.in_flight() > 0 => ConnectionState::Busy,
            Phase::Ready if shared.is_listening() => ConnectionState::Listening,
            Phase::Ready => ConnectionState::Idle,
        }
    }

    /// True if `close` was called.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// True if the last operation left the session unusable. The next
    /// operation reconnects.
    pub fn is_broken(&self) -> bool {
        self.inner.shared.is_broken()
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session) -> Result<T> + Send + 'static,
    {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return Err(Error::Closed);
        }
        let _in_flight = InFlight::enter(shared);

        let pending = self.inner.dispatcher.call(f);
        let result = match self.inner.statement_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(id = self.inner.id, ?limit, "operation timed out, closing connection");
                    shared.set_broken(true);
                    self.close_now();
                    return Err(Error::Timeout(limit));
                }
            },
            None => pending.await,
        };

        match result {
            Err(e) if shared.is_closed() && e.is_connection_broken() => Err(Error::Closed),
            other => other,
        }
    }

    /// Open the server session now instead of on first use.
    pub(crate) async fn open(&self) -> Result<()> {
        self.call(Session::connect).await
    }

    /// Run `sql` and return its result.
    ///
    /// Without parameters the text goes through the simple query protocol and
    /// may hold several statements; the result of the last one is returned.
    /// With parameters it must be a single statement using `$1`, `$2`, ...
    /// placeholders, which the server binds.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |s| s.query(&sql, params)).await
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        self.query("", &[]).await.map(drop)
    }

    /// Register `sql` under `name` for later [`execute`](Self::execute) calls.
    ///
    /// The statement is parsed on the server by its first execution and reused
    /// afterwards. Registering a name again replaces its SQL.
    pub async fn prepare(&self, name: &str, sql: &str) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        let sql = sql.to_string();
        self.call(move |s| {
            s.prepare(&name, &sql);
            Ok(())
        })
        .await
    }

    /// Run the statement registered under `name`.
    ///
    /// Fails with [`Error::NotPrepared`] if `name` was never registered.
    pub async fn execute(&self, name: &str, params: &[Value]) -> Result<QueryResult> {
        let name = name.to_string();
        let params = params.to_vec();
        self.call(move |s| s.execute(&name, params)).await
    }

    /// Forget the statement registered under `name` and release it on the
    /// server. Returns false if it was not registered.
    pub async fn deallocate(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.call(move |s| Ok(s.deallocate(&name))).await
    }

    /// Send every statement in one round trip and return one result per
    /// statement, in order.
    ///
    /// Each entry must be a single statement. If one fails, the call fails
    /// with [`Error::Pipeline`] naming its index and the rest are skipped.
    /// Statements are not wrapped in a transaction.
    pub async fn pipeline<S: AsRef<str>>(&self, queries: &[S]) -> Result<Vec<QueryResult>> {
        let queries: Vec<String> = queries.iter().map(|q| q.as_ref().to_string()).collect();
        self.call(move |s| s.pipeline(queries)).await
    }

    /// Subscribe `callback` to `channel`, replacing any earlier callback for
    /// the same channel.
    ///
    /// Callbacks run on a tokio task, one at a time and in arrival order,
    /// never inside this call.
    pub async fn listen<F>(&self, channel: &str, callback: F) -> Result<()>
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        if channel.is_empty() {
            return Err(Error::InvalidUsage("channel name is empty".into()));
        }
        // the server truncates longer names and would notify under the short one
        if channel.len() > MAX_NAME_LEN {
            return Err(Error::InvalidUsage(format!(
                "channel name {:?} is longer than {} bytes",
                channel, MAX_NAME_LEN
            )));
        }
        let outbox = self.inner.outbox.get_or_init(spawn_delivery).clone();
        let channel = channel.to_string();
        let callback: Callback = Arc::new(callback);
        self.call(move |s| s.listen(&channel, callback, outbox)).await
    }

    /// Drop the subscription for `channel`. Does nothing if there is none.
    pub async fn unlisten(&self, channel: &str) -> Result<()> {
        let channel = channel.to_string();
        self.call(move |s| s.unlisten(&channel)).await
    }

    /// Close the connection.
    ///
    /// Operations still pending fail with [`Error::Closed`]. Calling this
    /// again does nothing.
    pub async fn close(&self) {
        let Some(ack) = self.shut_down() else {
            return;
        };
        let _ = ack.await;
    }

    /// Close without waiting for the worker to finish.
    pub(crate) fn close_now(&self) {
        drop(self.shut_down());
    }

    fn shut_down(&self) -> Option<oneshot::Receiver<()>> {
        let shared = &self.inner.shared;
        if !shared.mark_closed() {
            return None;
        }
        shared.interrupt();
        let (done, ack) = oneshot::channel();
        let submitted = self.inner.dispatcher.submit(Box::new(move |session| {
            session.shutdown();
            let _ = done.send(());
        }));
        submitted.then_some(ack)
    }

    /// Close once everything queued so far has run.
    pub(crate) fn close_gracefully(&self) {
        let shared = Arc::clone(&self.inner.shared);
        self.inner.dispatcher.submit(Box::new(move |session| {
            shared.mark_closed();
            session.shutdown();
        }));
    }

    pub(crate) fn has_subscriptions(&self) -> bool {
        self.inner.shared.is_listening()
    }

    /// Queue `UNLISTEN *` ahead of whatever is submitted next.
    pub(crate) fn unlisten_all(&self) {
        let id = self.inner.id;
        self.inner.dispatcher.submit(Box::new(move |session| {
            if let Err(e) = session.unlisten_all() {
                tracing::debug!(id, error = %e, "UNLISTEN * failed");
            }
        }));
    }
}
