//! Error types for pgnx.

use std::time::Duration;

use thiserror::Error;

/// Result type for pgnx operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Fields of a PostgreSQL ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
}

impl ServerError {
    /// Build an ERROR-severity server error from a SQLSTATE code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Some("ERROR".into()),
            code: Some(code.into()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Returns true for FATAL and PANIC severities, after which the server
    /// terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(position) = self.position {
            write!(f, " at position {}", position)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgnx.
#[derive(Debug, Error)]
pub enum Error {
    /// The server could not be reached or the startup handshake failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection was closed, before or while the operation was pending.
    #[error("Connection is closed")]
    Closed,

    /// The server rejected a statement.
    #[error("Query error: {0}")]
    Query(ServerError),

    /// `execute` referenced a statement name that was never prepared.
    #[error("Prepared statement not found: {0}")]
    NotPrepared(String),

    /// A statement inside a pipeline failed; the whole batch is reported as failed.
    #[error("Pipeline failed at statement {index}: {source}")]
    Pipeline {
        /// Zero-based position of the failing statement in the batch.
        index: usize,
        /// The failure of that statement.
        source: Box<Error>,
    },

    /// Waiting for a pooled connection exceeded the configured timeout.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The pool has been ended.
    #[error("Pool is closed")]
    PoolClosed,

    /// A statement exceeded the configured statement timeout.
    #[error("Statement timed out after {0:?}")]
    Timeout(Duration),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// A value could not be decoded into the requested Rust type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid usage (malformed statement name, bad connection string, etc.)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::Closed
            | Error::Connection(_)
            | Error::Protocol(_)
            | Error::Timeout(_) => true,
            Error::Query(fields) => fields.is_fatal(),
            Error::Pipeline { source, .. } => source.is_connection_broken(),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(fields) => fields.code.as_deref(),
            Error::Pipeline { source, .. } => source.sqlstate(),
            _ => None,
        }
    }

    /// Get the server error payload, looking through pipeline failures.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Query(fields) => Some(fields),
            Error::Pipeline { source, .. } => source.server_error(),
            _ => None,
        }
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_display() {
        let mut err = ServerError::new("42P01", "relation \"missing\" does not exist");
        err.position = Some(15);
        assert_eq!(
            err.to_string(),
            "ERROR: relation \"missing\" does not exist (SQLSTATE 42P01) at position 15"
        );
    }

    #[test]
    fn broken_classification() {
        assert!(Error::Closed.is_connection_broken());
        assert!(!Error::NotPrepared("x".into()).is_connection_broken());
        assert!(!Error::Query(ServerError::new("23505", "dup")).is_connection_broken());

        let mut fatal = ServerError::new("57P01", "terminating connection");
        fatal.severity = Some("FATAL".into());
        assert!(Error::Query(fatal).is_connection_broken());
    }

    #[test]
    fn pipeline_error_exposes_inner_sqlstate() {
        let err = Error::Pipeline {
            index: 2,
            source: Box::new(Error::Query(ServerError::new("22012", "division by zero"))),
        };
        assert_eq!(err.sqlstate(), Some("22012"));
        assert!(err.to_string().starts_with("Pipeline failed at statement 2"));
    }
}
