//! Blocking PostgreSQL session.

use std::io::Write;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::notify::Notification;
use crate::opts::Opts;
use crate::pipeline::Batch;
use crate::protocol::RawMessage;
use crate::protocol::backend::{ErrorResponse, msg_type};
use crate::protocol::frontend::{write_query, write_terminate};
use crate::protocol::types::TransactionStatus;
use crate::row::QueryResult;
use crate::state::action::{Action, AsyncMessage};
use crate::state::batch::BatchStateMachine;
use crate::state::startup::StartupStateMachine;
use crate::transport::{Connect, Interrupt, Transport};

use super::stream::{MessageReader, Stream};

/// Limit the next blocking read to what is left before `deadline`.
fn arm_deadline(stream: &Stream, deadline: Option<Instant>) -> Result<()> {
    let Some(deadline) = deadline else {
        return Ok(());
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(Error::Connection("timed out during startup handshake".into()));
    }
    stream.set_read_timeout(Some(remaining))?;
    Ok(())
}

/// Block until a whole message is buffered and return it, giving up once
/// `deadline` passes.
fn read_message<'a>(
    stream: &mut Stream,
    reader: &'a mut MessageReader,
    deadline: Option<Instant>,
) -> Result<RawMessage<'a>> {
    while !reader.has_message()? {
        arm_deadline(stream, deadline)?;
        reader.fill(stream)?;
    }
    reader
        .next_message()?
        .ok_or_else(|| Error::Protocol("message vanished from read buffer".into()))
}

/// Synchronous PostgreSQL connection.
pub struct Conn {
    stream: Stream,
    reader: MessageReader,
    write_buffer: Vec<u8>,
    backend_pid: Option<u32>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    notifications: Vec<Notification>,
    is_broken: bool,
}

impl Conn {
    /// Connect to a PostgreSQL server.
    ///
    /// A `host` starting with `/` names the directory of a Unix-domain socket.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        Self::open(&opts, &|_| {})
    }

    /// Connect, handing `on_socket` an interrupter as soon as the socket
    /// exists so another thread can abort the handshake.
    ///
    /// `connect_timeout` bounds the TCP connect and, separately, the whole
    /// startup handshake.
    pub fn open(opts: &Opts, on_socket: &dyn Fn(Box<dyn Interrupt>)) -> Result<Self> {
        if opts.host.is_empty() {
            return Err(Error::InvalidUsage("host is empty".into()));
        }

        #[cfg(unix)]
        let stream = if opts.host.starts_with('/') {
            Stream::connect_unix(&opts.host, opts.port)?
        } else {
            Stream::connect_tcp(&opts.host, opts.port, opts.connect_timeout)?
        };
        #[cfg(not(unix))]
        let stream = Stream::connect_tcp(&opts.host, opts.port, opts.connect_timeout)?;

        if let Some(interrupter) = stream.interrupter() {
            on_socket(interrupter);
        }
        Self::new_with_stream(stream, opts).map_err(|e| match e {
            Error::Io(io) => Error::Connection(format!("handshake failed: {}", io)),
            other => other,
        })
    }

    /// Run the startup handshake over an existing stream.
    pub fn new_with_stream(mut stream: Stream, opts: &Opts) -> Result<Self> {
        let tls_available = cfg!(feature = "tls") && stream.is_tcp();
        let mut state_machine = StartupStateMachine::new(opts.clone(), tls_available);
        let mut reader = MessageReader::new();
        let mut notifications = Vec::new();

        let deadline = opts.connect_timeout.map(|timeout| Instant::now() + timeout);
        stream.set_write_timeout(opts.connect_timeout)?;

        let mut action = state_machine.start()?;
        loop {
            action = match action {
                Action::WriteAndReadByte => {
                    stream.write_all(state_machine.write_buffer())?;
                    stream.flush()?;
                    arm_deadline(&stream, deadline)?;
                    let response = stream.read_byte()?;
                    state_machine.process_ssl_response(response)?
                }
                Action::TlsHandshake => {
                    #[cfg(feature = "tls")]
                    {
                        arm_deadline(&stream, deadline)?;
                        let (upgraded, channel_binding) = stream.upgrade_to_tls(&opts.host)?;
                        stream = upgraded;
                        state_machine.tls_handshake_complete(channel_binding)
                    }
                    #[cfg(not(feature = "tls"))]
                    {
                        return Err(Error::Connection(
                            "server accepted TLS but TLS support is not compiled in".into(),
                        ));
                    }
                }
                Action::WriteAndReadMessage => {
                    stream.write_all(state_machine.write_buffer())?;
                    stream.flush()?;
                    let msg = read_message(&mut stream, &mut reader, deadline)?;
                    state_machine.step(msg)?
                }
                Action::ReadMessage => {
                    let msg = read_message(&mut stream, &mut reader, deadline)?;
                    state_machine.step(msg)?
                }
                Action::HandleAsyncMessageAndReadMessage(async_msg) => {
                    if let AsyncMessage::Notification(n) = async_msg {
                        notifications.push(n);
                    }
                    let msg = read_message(&mut stream, &mut reader, deadline)?;
                    state_machine.step(msg)?
                }
                Action::Finished => break,
            };
        }
        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        tracing::debug!(
            pid = state_machine.backend_pid(),
            host = %opts.host,
            "connection established"
        );

        Ok(Self {
            stream,
            reader,
            write_buffer: Vec::with_capacity(8192),
            backend_pid: state_machine.backend_pid(),
            server_params: state_machine.server_params().to_vec(),
            transaction_status: state_machine.transaction_status(),
            notifications,
            is_broken: false,
        })
    }

    /// Backend process ID, if the server sent BackendKeyData.
    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    /// Server parameters reported at startup and since.
    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    /// Look up a server parameter such as `server_version`.
    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_broken {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Mark the connection broken when `result` says so.
    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.as_ref().is_err_and(Error::is_connection_broken) {
            self.is_broken = true;
        }
        result
    }

    fn handle_async(&mut self, msg: AsyncMessage) {
        match msg {
            AsyncMessage::Notification(n) => self.notifications.push(n),
            AsyncMessage::Notice(notice) => {
                tracing::debug!(%notice, "server notice");
            }
            AsyncMessage::ParameterChanged { name, value } => {
                match self.server_params.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = value,
                    None => self.server_params.push((name, value)),
                }
            }
        }
    }

    /// Write the pending request and feed responses to `state_machine` until ReadyForQuery.
    fn drive(&mut self, state_machine: &mut BatchStateMachine) -> Result<()> {
        self.stream.write_all(&self.write_buffer)?;
        self.stream.flush()?;

        loop {
            let msg = read_message(&mut self.stream, &mut self.reader, None)?;
            match state_machine.step(msg)? {
                Action::ReadMessage => {}
                Action::HandleAsyncMessageAndReadMessage(async_msg) => {
                    self.handle_async(async_msg)
                }
                Action::WriteAndReadMessage => {
                    self.stream.write_all(state_machine.write_buffer())?;
                    self.stream.flush()?;
                }
                Action::Finished => {
                    self.transaction_status = state_machine.transaction_status();
                    return Ok(());
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "Unexpected action in query cycle: {:?}",
                        other
                    )));
                }
            }
        }
    }

    fn run_cycle(&mut self) -> Result<BatchStateMachine> {
        let mut state_machine = BatchStateMachine::new();
        let result = self.drive(&mut state_machine);
        self.track(result)?;
        Ok(state_machine)
    }

    fn poll_inner(&mut self, timeout: Duration) -> Result<()> {
        if !self.reader.has_message()? {
            // a zero read timeout means "block forever" to the OS
            self.stream
                .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            let filled = self.reader.fill(&mut self.stream);
            self.stream.set_read_timeout(None)?;
            filled?;
        }

        while let Some(msg) = self.reader.next_message()? {
            if msg.type_byte == msg_type::ERROR_RESPONSE {
                return Err(ErrorResponse::parse(msg.payload)?.into_error());
            }
            if !msg.is_async() {
                return Err(Error::Protocol(format!(
                    "Unexpected message '{}' outside a query cycle",
                    msg.type_byte as char
                )));
            }
            let async_msg = AsyncMessage::parse(&msg)?;
            self.handle_async(async_msg);
        }
        Ok(())
    }
}

impl Transport for Conn {
    fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.check_usable()?;
        self.write_buffer.clear();
        write_query(&mut self.write_buffer, sql);

        let state_machine = self.run_cycle()?;
        let result = state_machine
            .finish()
            .map_err(|(_, error)| Error::Query(error));
        self.track(result)
    }

    fn run_batch(&mut self, batch: &Batch) -> Result<Vec<QueryResult>> {
        self.check_usable()?;
        self.write_buffer.clear();
        batch.encode(&mut self.write_buffer);

        let state_machine = self.run_cycle()?;
        let result = state_machine.finish().map_err(|(index, error)| {
            tracing::debug!(index, %error, "batch request failed");
            Error::Pipeline {
                index,
                source: Box::new(Error::Query(error)),
            }
        });
        self.track(result)
    }

    fn poll(&mut self, timeout: Duration) -> Result<()> {
        self.check_usable()?;
        let result = self.poll_inner(timeout);
        self.track(result)
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        self.stream.interrupter()
    }

    fn is_broken(&self) -> bool {
        self.is_broken
    }

    fn terminate(&mut self) {
        if !self.is_broken {
            self.write_buffer.clear();
            write_terminate(&mut self.write_buffer);
            let _ = self.stream.write_all(&self.write_buffer);
            let _ = self.stream.flush();
        }
        self.is_broken = true;
        if let Some(interrupter) = self.stream.interrupter() {
            interrupter.interrupt();
        }
    }
}

/// Opens [`Conn`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl Connect for PgConnector {
    fn connect(
        &self,
        opts: &Opts,
        on_socket: &dyn Fn(Box<dyn Interrupt>),
    ) -> Result<Box<dyn Transport>> {
        Ok(Box::new(Conn::open(opts, on_socket)?))
    }
}
