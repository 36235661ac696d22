use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

#[cfg(feature = "tls")]
use native_tls::TlsStream;

use crate::error::{Error, Result};
use crate::protocol::RawMessage;
use crate::transport::Interrupt;

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    /// Connect over TCP, trying every resolved address in turn.
    pub fn connect_tcp(host: &str, port: u16, timeout: Option<Duration>) -> Result<Self> {
        let mut last_error = None;
        for addr in (host, port).to_socket_addrs()? {
            let attempt = match timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    return Ok(Self::Tcp(tcp));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => Error::Connection(format!("could not connect to {}:{}: {}", host, port, e)),
            None => Error::Connection(format!("could not resolve {}", host)),
        })
    }

    /// Connect to the server socket in directory `dir` (libpq's `host=/path`).
    #[cfg(unix)]
    pub fn connect_unix(dir: &str, port: u16) -> Result<Self> {
        let path = format!("{}/.s.PGSQL.{}", dir.trim_end_matches('/'), port);
        UnixStream::connect(&path)
            .map(Self::Unix)
            .map_err(|e| Error::Connection(format!("could not connect to {}: {}", path, e)))
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Stream::Tcp(_))
    }

    /// Upgrade a plain TCP stream to TLS and return the `tls-server-end-point`
    /// channel binding data, when the certificate's signature algorithm has one.
    ///
    /// Certificates are not verified, which is what `sslmode=require` means.
    #[cfg(feature = "tls")]
    pub fn upgrade_to_tls(self, host: &str) -> Result<(Self, Option<Vec<u8>>)> {
        let Stream::Tcp(tcp) = self else {
            return Err(Error::Protocol("TLS upgrade requires a TCP stream".into()));
        };
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let tls = connector
            .connect(host, tcp)
            .map_err(|e| Error::Connection(format!("TLS handshake failed: {}", e)))?;
        let channel_binding = tls.tls_server_end_point().ok().flatten();
        Ok((Stream::Tls(Box::new(tls)), channel_binding))
    }

    /// Read a single byte outside message framing (SSL negotiation).
    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_read_timeout(timeout),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_read_timeout(timeout),
        }
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_write_timeout(timeout),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.get_ref().set_write_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_write_timeout(timeout),
        }
    }

    /// Handle that shuts the socket down from another thread.
    pub fn interrupter(&self) -> Option<Box<dyn Interrupt>> {
        match self {
            Stream::Tcp(s) => s.try_clone().ok().map(|s| Box::new(TcpInterrupt(s)) as _),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s
                .get_ref()
                .try_clone()
                .ok()
                .map(|s| Box::new(TcpInterrupt(s)) as _),
            #[cfg(unix)]
            Stream::Unix(s) => s.try_clone().ok().map(|s| Box::new(UnixInterrupt(s)) as _),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

struct TcpInterrupt(TcpStream);

impl Interrupt for TcpInterrupt {
    fn interrupt(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

#[cfg(unix)]
struct UnixInterrupt(UnixStream);

#[cfg(unix)]
impl Interrupt for UnixInterrupt {
    fn interrupt(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

const READ_CHUNK: usize = 8192;

/// Accumulating reader that splits the byte stream into backend messages.
///
/// Bytes stay buffered until a whole message has arrived, so a read that
/// times out halfway through a message loses nothing.
#[derive(Default)]
pub struct MessageReader {
    buf: Vec<u8>,
    pos: usize,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
        }
    }

    /// Length of the next complete message (header included), if buffered.
    fn complete_len(&self) -> Result<Option<usize>> {
        let pending = &self.buf[self.pos..];
        if pending.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([pending[1], pending[2], pending[3], pending[4]]) as usize;
        if len < 4 {
            return Err(Error::Protocol(format!("Invalid message length: {}", len)));
        }
        Ok((pending.len() > len).then_some(len + 1))
    }

    pub fn has_message(&self) -> Result<bool> {
        Ok(self.complete_len()?.is_some())
    }

    /// Pop the next complete message, if one is buffered.
    pub fn next_message(&mut self) -> Result<Option<RawMessage<'_>>> {
        let Some(total) = self.complete_len()? else {
            return Ok(None);
        };
        let start = self.pos;
        self.pos += total;
        let message = &self.buf[start..start + total];
        Ok(Some(RawMessage::new(message[0], &message[5..])))
    }

    /// Read once from `stream`. Returns false on a timeout.
    pub fn fill(&mut self, stream: &mut Stream) -> Result<bool> {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);
        let read = stream.read(&mut self.buf[old_len..]);
        let n = match read {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                self.buf.truncate(old_len);
                return Ok(false);
            }
            Err(e) => {
                self.buf.truncate(old_len);
                return Err(e.into());
            }
        };
        self.buf.truncate(old_len + n);
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        Ok(true)
    }
}
