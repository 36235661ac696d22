//! Scripted in-process server for exercising connections and pools without
//! a database.
//!
//! Behavior of the fake server:
//! - every request cycle costs one `latency` round trip; a batch is one cycle
//! - SQL containing `error` fails with SQLSTATE 42601
//! - `SELECT 1` returns the integer 1, other SELECTs return their parameters
//!   or, without parameters, their own text
//! - INSERT/UPDATE/DELETE report one affected row
//! - LISTEN/UNLISTEN maintain the per-session channel set used to route
//!   notifications queued with [`MockServer::notify`]

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pgnx::pipeline::Batch;
use pgnx::transport::{Connect, Interrupt, Transport};
use pgnx::{Column, Error, Notification, Opts, QueryResult, Row, ServerError, SslMode, Value};

/// A server that accepts TCP connections and never says a word.
pub fn silent_server() -> Opts {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming().flatten() {
            held.push(stream);
        }
    });
    Opts {
        host: "127.0.0.1".into(),
        port,
        user: "test".into(),
        ssl_mode: SslMode::Disable,
        connect_timeout: None,
        ..Opts::default()
    }
}

pub fn opts() -> Opts {
    Opts {
        host: "mock".into(),
        user: "test".into(),
        ..Opts::default()
    }
}

#[derive(Default)]
pub struct MockServer {
    latency: Duration,
    handshake: Duration,
    connects: AtomicUsize,
    terminates: AtomicUsize,
    parses: AtomicUsize,
    closes: AtomicUsize,
    batches: AtomicUsize,
    simple_queries: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    refuse_connections: AtomicBool,
    break_next: AtomicBool,
    break_poll: AtomicBool,
    pending: Mutex<VecDeque<Notification>>,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Self::with_latency(Duration::ZERO, Duration::ZERO)
    }

    pub fn with_latency(latency: Duration, handshake: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            handshake,
            ..Self::default()
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connect> {
        Arc::new(MockConnector(Arc::clone(self)))
    }

    /// Queue a notification for the next session listening on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) {
        self.pending
            .lock()
            .unwrap()
            .push_back(Notification::new(4242, channel, payload));
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make the next request cycle fail with a broken socket.
    pub fn break_next(&self) {
        self.break_next.store(true, Ordering::SeqCst);
    }

    /// Make the next notification poll fail with a broken socket.
    pub fn break_poll(&self) {
        self.break_poll.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn terminates(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    pub fn parses(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn simple_queries(&self) -> usize {
        self.simple_queries.load(Ordering::SeqCst)
    }

    /// Requests sent to the server, of any kind.
    pub fn requests(&self) -> usize {
        self.batches() + self.simple_queries()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct MockConnector(Arc<MockServer>);

impl Connect for MockConnector {
    fn connect(
        &self,
        _opts: &Opts,
        on_socket: &dyn Fn(Box<dyn Interrupt>),
    ) -> pgnx::Result<Box<dyn Transport>> {
        let interrupted = Arc::new(AtomicBool::new(false));
        on_socket(Box::new(MockInterrupt(Arc::clone(&interrupted))));
        let mut transport = MockTransport {
            server: Arc::clone(&self.0),
            prepared: HashMap::new(),
            channels: HashSet::new(),
            inbox: Vec::new(),
            broken: false,
            interrupted,
        };
        transport.wait(self.0.handshake)?;
        if self.0.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::Connection("connection refused".into()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(transport))
    }
}

struct MockInterrupt(Arc<AtomicBool>);

impl Interrupt for MockInterrupt {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct MockTransport {
    server: Arc<MockServer>,
    prepared: HashMap<String, String>,
    channels: HashSet<String>,
    inbox: Vec<Notification>,
    broken: bool,
    interrupted: Arc<AtomicBool>,
}

fn aborted() -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "socket shut down",
    ))
}

fn failed_at(index: usize, error: ServerError) -> Error {
    Error::Pipeline {
        index,
        source: Box::new(Error::Query(error)),
    }
}

fn unquote(ident: &str) -> String {
    ident.trim_matches('"').replace("\"\"", "\"")
}

fn respond(sql: &str, params: &[Value]) -> Result<QueryResult, ServerError> {
    if sql.contains("error") {
        return Err(ServerError::new("42601", "syntax error at or near \"error\""));
    }
    let verb = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if verb == "SELECT" {
        let values = if !params.is_empty() {
            params.to_vec()
        } else if sql.trim() == "SELECT 1" {
            vec![Value::Int(1)]
        } else {
            vec![Value::Text(sql.to_string())]
        };
        let columns: Arc<[Column]> = (0..values.len())
            .map(|i| Column::new(format!("c{i}"), 25))
            .collect();
        let row = Row::new(Arc::clone(&columns), values);
        return Ok(QueryResult::new(columns, vec![row], "SELECT 1"));
    }
    let tag = match verb.as_str() {
        "INSERT" => "INSERT 0 1".to_string(),
        "UPDATE" | "DELETE" => format!("{verb} 1"),
        _ => verb,
    };
    Ok(QueryResult::new(Arc::from(Vec::new()), Vec::new(), tag))
}

impl MockTransport {
    fn collect_notifications(&mut self) {
        let mut pending = self.server.pending.lock().unwrap();
        let mut rest = VecDeque::new();
        while let Some(n) = pending.pop_front() {
            if self.channels.contains(n.channel()) {
                self.inbox.push(n);
            } else {
                rest.push_back(n);
            }
        }
        *pending = rest;
    }

    fn wait(&mut self, duration: Duration) -> pgnx::Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                self.broken = true;
                return Err(aborted());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }

    fn round_trip(&mut self) -> pgnx::Result<()> {
        if self.broken {
            return Err(Error::Closed);
        }
        let active = self.server.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.server.max_active.fetch_max(active, Ordering::SeqCst);
        let waited = self.wait(self.server.latency);
        self.server.active.fetch_sub(1, Ordering::SeqCst);
        waited?;

        if self.server.break_next.swap(false, Ordering::SeqCst) {
            self.broken = true;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "server went away",
            )));
        }
        self.collect_notifications();
        Ok(())
    }
}

impl Transport for MockTransport {
    fn simple_query(&mut self, sql: &str) -> pgnx::Result<Vec<QueryResult>> {
        self.round_trip()?;
        self.server.simple_queries.fetch_add(1, Ordering::SeqCst);

        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if trimmed == "UNLISTEN *" {
            self.channels.clear();
        } else if let Some(channel) = trimmed.strip_prefix("UNLISTEN ") {
            self.channels.remove(&unquote(channel));
        } else if let Some(channel) = trimmed.strip_prefix("LISTEN ") {
            self.channels.insert(unquote(channel));
        }
        respond(trimmed, &[]).map(|r| vec![r]).map_err(Error::Query)
    }

    fn run_batch(&mut self, batch: &Batch) -> pgnx::Result<Vec<QueryResult>> {
        self.round_trip()?;
        self.server.batches.fetch_add(1, Ordering::SeqCst);

        for name in batch.closes() {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
            self.prepared.remove(name);
        }

        let mut results = Vec::new();
        for (index, request) in batch.requests().iter().enumerate() {
            let sql = match &request.parse {
                Some(sql) => {
                    self.server.parses.fetch_add(1, Ordering::SeqCst);
                    if !request.statement.is_empty() {
                        if self.prepared.contains_key(&request.statement) {
                            return Err(failed_at(
                                index,
                                ServerError::new("42P05", "prepared statement already exists"),
                            ));
                        }
                        self.prepared.insert(request.statement.clone(), sql.clone());
                    }
                    sql.clone()
                }
                None => match self.prepared.get(&request.statement) {
                    Some(sql) => sql.clone(),
                    None => {
                        return Err(failed_at(
                            index,
                            ServerError::new("26000", "prepared statement does not exist"),
                        ));
                    }
                },
            };
            results.push(respond(&sql, &request.params).map_err(|e| failed_at(index, e))?);
        }
        Ok(results)
    }

    fn poll(&mut self, timeout: Duration) -> pgnx::Result<()> {
        if self.broken {
            return Err(Error::Closed);
        }
        if self.server.break_poll.swap(false, Ordering::SeqCst) {
            self.broken = true;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "server went away",
            )));
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.collect_notifications();
            if !self.inbox.is_empty() || Instant::now() >= deadline {
                return Ok(());
            }
            self.wait(Duration::from_millis(1))?;
        }
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.inbox)
    }

    fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        Some(Box::new(MockInterrupt(Arc::clone(&self.interrupted))))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    fn terminate(&mut self) {
        self.broken = true;
        self.server.terminates.fetch_add(1, Ordering::SeqCst);
    }
}
