//! Extended-protocol request batches.
//!
//! A [`Batch`] is written to the wire in one go: pending statement closes
//! first, then Parse (when needed), Bind, Describe and Execute for every
//! request, and a single Sync at the end. The server answers each request in
//! order, so result *i* belongs to request *i*.

use crate::protocol::frontend::{
    write_bind, write_close_statement, write_describe_portal, write_execute, write_parse,
    write_sync,
};
use crate::value::Value;

/// One statement execution inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// SQL to parse first, or `None` when `statement` is already prepared.
    pub parse: Option<String>,
    /// Statement name; empty for the unnamed statement.
    pub statement: String,
    pub params: Vec<Value>,
}

/// Requests sent back-to-back before one Sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    closes: Vec<String>,
    requests: Vec<Request>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close a named statement before any request runs.
    pub fn close(&mut self, name: impl Into<String>) -> &mut Self {
        self.closes.push(name.into());
        self
    }

    /// Parse `sql` into the unnamed statement and run it.
    pub fn unnamed(&mut self, sql: impl Into<String>, params: Vec<Value>) -> &mut Self {
        self.requests.push(Request {
            parse: Some(sql.into()),
            statement: String::new(),
            params,
        });
        self
    }

    /// Parse `sql` under `name` and run it.
    pub fn parse_and_run(
        &mut self,
        name: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> &mut Self {
        self.requests.push(Request {
            parse: Some(sql.into()),
            statement: name.into(),
            params,
        });
        self
    }

    /// Run the already prepared statement `name`.
    pub fn run(&mut self, name: impl Into<String>, params: Vec<Value>) -> &mut Self {
        self.requests.push(Request {
            parse: None,
            statement: name.into(),
            params,
        });
        self
    }

    pub fn closes(&self) -> &[String] {
        &self.closes
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Number of requests, not counting closes.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.closes.is_empty()
    }

    /// Encode the whole batch, including the trailing Sync.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        for name in &self.closes {
            write_close_statement(buf, name);
        }
        for request in &self.requests {
            if let Some(sql) = &request.parse {
                write_parse(buf, &request.statement, sql);
            }
            write_bind(buf, &request.statement, &request.params);
            write_describe_portal(buf);
            write_execute(buf);
        }
        write_sync(buf);
    }
}
