//! Worker-side state of a connection.
//!
//! A [`Session`] lives on its connection's worker thread and is only ever
//! touched by jobs running there, so the transport, the statement registry
//! and the notification router need no locking. The few facts the async side
//! needs to read without queueing a job are mirrored into [`Shared`].

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::notify::{Callback, Outbox, Router, quote_ident};
use crate::opts::Opts;
use crate::pipeline::Batch;
use crate::row::QueryResult;
use crate::statement::Registry;
use crate::transport::{Connect, Interrupt, Transport};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    NotConnected,
    Connecting,
    Ready,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Connecting,
            2 => Phase::Ready,
            _ => Phase::NotConnected,
        }
    }
}

/// State readable from any thread.
#[derive(Default)]
pub(crate) struct Shared {
    closed: AtomicBool,
    broken: AtomicBool,
    listening: AtomicBool,
    in_flight: AtomicUsize,
    phase: AtomicU8,
    interrupter: Mutex<Option<Box<dyn Interrupt>>>,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if the connection was already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn set_broken(&self, broken: bool) {
        self.broken.store(broken, Ordering::Release);
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn set_interrupter(&self, interrupter: Option<Box<dyn Interrupt>>) {
        *self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = interrupter;
    }

    /// Install the interrupter of a socket that is still in its handshake.
    /// A close that got here first takes effect at once.
    fn arm(&self, interrupter: Box<dyn Interrupt>) {
        self.set_interrupter(Some(interrupter));
        if self.is_closed() {
            self.interrupt();
        }
    }

    /// Abort whatever the worker is blocked on.
    pub(crate) fn interrupt(&self) {
        let guard = self
            .interrupter
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(interrupter) = guard.as_ref() {
            interrupter.interrupt();
        }
    }
}

const RECONNECT_BACKOFF_MIN: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// A failure of a single-request batch is the failure of that request.
fn unwrap_single(error: Error) -> Error {
    match error {
        Error::Pipeline { source, .. } => *source,
        other => other,
    }
}

pub(crate) struct Session {
    id: u64,
    opts: Opts,
    connector: Arc<dyn Connect>,
    transport: Option<Box<dyn Transport>>,
    registry: Registry,
    router: Router,
    shared: Arc<Shared>,
    /// Backoff and next attempt for reopening a broken listening session.
    retry: Option<(Duration, Instant)>,
    stopped: bool,
}

impl Session {
    pub(crate) fn new(id: u64, opts: Opts, connector: Arc<dyn Connect>, shared: Arc<Shared>) -> Self {
        Self {
            id,
            opts,
            connector,
            transport: None,
            registry: Registry::new(),
            router: Router::new(),
            shared,
            retry: None,
            stopped: false,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// True once the worker should exit.
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// True while the worker should watch the socket between jobs, or bring a
    /// broken one back for its subscriptions.
    pub(crate) fn is_listening(&self) -> bool {
        !self.stopped && !self.router.is_empty() && !self.shared.is_closed()
    }

    fn sync_listening(&self) {
        self.shared
            .listening
            .store(!self.router.is_empty(), Ordering::Release);
    }

    /// Open the transport if there is none or the current one broke.
    pub(crate) fn connect(&mut self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(Error::Closed);
        }
        if self.transport.as_ref().is_some_and(|t| !t.is_broken()) {
            return Ok(());
        }
        if let Some(mut old) = self.transport.take() {
            tracing::debug!(id = self.id, "replacing broken transport");
            old.terminate();
        }

        self.shared.set_phase(Phase::Connecting);
        let shared = &self.shared;
        let mut transport = match self.connector.connect(&self.opts, &|i| shared.arm(i)) {
            Ok(transport) => transport,
            Err(e) => {
                tracing::debug!(id = self.id, error = %e, "connect failed");
                self.shared.set_interrupter(None);
                self.shared.set_phase(Phase::NotConnected);
                return Err(e);
            }
        };

        self.registry.reset_server_state();
        let channels: Vec<String> = self.router.channels().map(str::to_string).collect();
        for channel in &channels {
            if let Err(e) = transport.simple_query(&format!("LISTEN {}", quote_ident(channel))) {
                transport.terminate();
                self.shared.set_interrupter(None);
                self.shared.set_phase(Phase::NotConnected);
                return Err(e);
            }
        }

        self.shared.set_interrupter(transport.interrupter());
        self.shared.set_broken(false);
        self.transport = Some(transport);
        self.shared.set_phase(Phase::Ready);
        self.retry = None;
        tracing::debug!(id = self.id, resubscribed = channels.len(), "connected");

        if self.shared.is_closed() {
            self.shutdown();
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Run `f` against the open transport and route whatever notifications
    /// it buffered meanwhile.
    fn run<T>(&mut self, f: impl FnOnce(&mut dyn Transport) -> Result<T>) -> Result<T> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::Closed);
        };
        let result = f(transport.as_mut());
        let notifications = transport.take_notifications();
        let broken =
            transport.is_broken() || matches!(&result, Err(e) if e.is_connection_broken());
        if broken {
            self.shared.set_broken(true);
        }
        for notification in notifications {
            self.router.route(notification);
        }
        result
    }

    /// A batch preloaded with the closes the registry owes the server.
    fn batch(&mut self) -> Batch {
        let mut batch = Batch::new();
        for name in self.registry.take_retired() {
            batch.close(name);
        }
        batch
    }

    pub(crate) fn query(&mut self, sql: &str, params: Vec<Value>) -> Result<QueryResult> {
        self.connect()?;
        if params.is_empty() {
            let mut results = self.run(|t| t.simple_query(sql))?;
            return Ok(results.pop().unwrap_or_default());
        }

        let mut batch = self.batch();
        batch.unnamed(sql, params);
        let mut results = self.run(|t| t.run_batch(&batch)).map_err(unwrap_single)?;
        Ok(results.pop().unwrap_or_default())
    }

    pub(crate) fn prepare(&mut self, name: &str, sql: &str) {
        self.registry.register(name, sql);
    }

    pub(crate) fn execute(&mut self, name: &str, params: Vec<Value>) -> Result<QueryResult> {
        if !self.registry.contains(name) {
            return Err(Error::NotPrepared(name.to_string()));
        }
        self.connect()?;

        let Some((sql, prepared)) = self.registry.lookup(name) else {
            return Err(Error::NotPrepared(name.to_string()));
        };
        let sql = (!prepared).then(|| sql.to_string());

        let mut batch = self.batch();
        match &sql {
            Some(sql) => batch.parse_and_run(name, sql.as_str(), params),
            None => batch.run(name, params),
        };

        let result = self.run(|t| t.run_batch(&batch)).map_err(unwrap_single);
        if sql.is_some() {
            match &result {
                Ok(_) => self.registry.mark_prepared(name),
                Err(_) => self.registry.mark_failed(name),
            }
        }
        let mut results = result?;
        Ok(results.pop().unwrap_or_default())
    }

    pub(crate) fn deallocate(&mut self, name: &str) -> bool {
        self.registry.remove(name)
    }

    pub(crate) fn pipeline(&mut self, queries: Vec<String>) -> Result<Vec<QueryResult>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        self.connect()?;

        let mut batch = self.batch();
        for sql in queries {
            batch.unnamed(sql, Vec::new());
        }
        self.run(|t| t.run_batch(&batch))
    }

    pub(crate) fn listen(&mut self, channel: &str, callback: Callback, outbox: Outbox) -> Result<()> {
        self.connect()?;
        if !self.router.contains(channel) {
            let sql = format!("LISTEN {}", quote_ident(channel));
            self.run(|t| t.simple_query(&sql))?;
        }
        self.router.subscribe(channel, callback, outbox);
        self.sync_listening();
        Ok(())
    }

    pub(crate) fn unlisten(&mut self, channel: &str) -> Result<()> {
        if !self.router.unsubscribe(channel) {
            return Ok(());
        }
        self.sync_listening();
        if !self.is_usable() {
            return Ok(());
        }
        let sql = format!("UNLISTEN {}", quote_ident(channel));
        self.run(|t| t.simple_query(&sql)).map(drop)
    }

    pub(crate) fn unlisten_all(&mut self) -> Result<()> {
        self.router.clear();
        self.sync_listening();
        if !self.is_usable() {
            return Ok(());
        }
        self.run(|t| t.simple_query("UNLISTEN *")).map(drop)
    }

    fn is_usable(&self) -> bool {
        !self.shared.is_closed() && self.transport.as_ref().is_some_and(|t| !t.is_broken())
    }

    /// Wait briefly on the socket for notifications. A broken session is
    /// reopened, with backoff, so subscriptions do not wait for the next call.
    pub(crate) fn poll_notifications(&mut self) {
        let interval = self.opts.notification_poll_interval;
        if !self.is_usable() {
            self.reconnect_listener(interval);
            return;
        }
        match self.run(|t| t.poll(interval)) {
            Err(e) if !self.shared.is_closed() => {
                tracing::warn!(id = self.id, error = %e, "listening connection failed");
            }
            _ => {}
        }
    }

    fn reconnect_listener(&mut self, interval: Duration) {
        let now = Instant::now();
        if let Some((_, at)) = self.retry.filter(|(_, at)| *at > now) {
            std::thread::sleep((at - now).min(interval));
            return;
        }
        if let Err(e) = self.connect() {
            let backoff = self
                .retry
                .map_or(RECONNECT_BACKOFF_MIN, |(b, _)| (b * 2).min(RECONNECT_BACKOFF_MAX));
            tracing::warn!(id = self.id, error = %e, ?backoff, "could not reopen listening connection");
            self.retry = Some((backoff, Instant::now() + backoff));
        }
    }

    /// Terminate the transport and stop the worker.
    pub(crate) fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.terminate();
            tracing::debug!(id = self.id, "connection closed");
        }
        self.shared.set_interrupter(None);
        self.shared.set_phase(Phase::NotConnected);
        self.router.clear();
        self.sync_listening();
        self.stopped = true;
    }
}
