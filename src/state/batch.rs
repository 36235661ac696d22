//! Response state machine for simple queries and extended-protocol batches.
//!
//! One machine serves both: a simple Query and a batch of
//! Parse/Bind/Describe/Execute requests closed by a single Sync both answer
//! with a sequence of per-statement results followed by ReadyForQuery. After
//! an ErrorResponse the server discards the rest of the cycle, so the machine
//! records the failing statement index and drains until ReadyForQuery.

use std::sync::Arc;

use crate::error::{Error, Result, ServerError};
use crate::protocol::RawMessage;
use crate::protocol::backend::{
    CommandComplete, DataRow, ErrorResponse, ReadyForQuery, RowDescription, msg_type,
};
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::TransactionStatus;
use crate::row::{Column, QueryResult, Row};
use crate::value::Value;

use super::action::{Action, AsyncMessage};

const COPY_IN_RESPONSE: u8 = b'G';
const COPY_OUT_RESPONSE: u8 = b'H';
const COPY_DATA: u8 = b'd';
const COPY_DONE: u8 = b'c';
const COPY_FAIL: u8 = b'f';

/// Collects results until ReadyForQuery.
pub struct BatchStateMachine {
    results: Vec<QueryResult>,
    columns: Option<Arc<[Column]>>,
    rows: Vec<Row>,
    error: Option<(usize, ServerError)>,
    transaction_status: TransactionStatus,
    write_buffer: Vec<u8>,
    finished: bool,
}

impl Default for BatchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchStateMachine {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            columns: None,
            rows: Vec::new(),
            error: None,
            transaction_status: TransactionStatus::Idle,
            write_buffer: Vec::new(),
            finished: false,
        }
    }

    /// Bytes to send for a `WriteAndReadMessage` action.
    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Process a message from the server.
    pub fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        if msg.is_async() {
            return Ok(Action::HandleAsyncMessageAndReadMessage(
                AsyncMessage::parse(&msg)?,
            ));
        }

        if self.error.is_some() && msg.type_byte != msg_type::READY_FOR_QUERY {
            return Ok(Action::ReadMessage);
        }

        match msg.type_byte {
            msg_type::PARSE_COMPLETE
            | msg_type::BIND_COMPLETE
            | msg_type::CLOSE_COMPLETE
            | msg_type::NO_DATA
            | COPY_OUT_RESPONSE
            | COPY_DATA
            | COPY_DONE => Ok(Action::ReadMessage),
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(msg.payload)?;
                let columns: Vec<Column> = desc
                    .fields()
                    .iter()
                    .map(|f| Column::new(f.name, f.type_oid()))
                    .collect();
                self.columns = Some(columns.into());
                self.rows.clear();
                Ok(Action::ReadMessage)
            }
            msg_type::DATA_ROW => {
                let columns = self.columns.clone().ok_or_else(|| {
                    Error::Protocol("DataRow received before RowDescription".into())
                })?;
                let row = DataRow::parse(msg.payload)?;
                if row.len() != columns.len() {
                    return Err(Error::Protocol(format!(
                        "DataRow has {} columns, RowDescription has {}",
                        row.len(),
                        columns.len()
                    )));
                }
                let values = columns
                    .iter()
                    .zip(row.iter())
                    .map(|(column, raw)| match raw {
                        None => Ok(Value::Null),
                        Some(bytes) => Value::decode_text(column.type_oid(), bytes),
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.rows.push(Row::new(columns, values));
                Ok(Action::ReadMessage)
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(msg.payload)?;
                self.finish_result(complete.tag);
                Ok(Action::ReadMessage)
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.finish_result("");
                Ok(Action::ReadMessage)
            }
            COPY_IN_RESPONSE => {
                self.write_buffer.clear();
                let mut copy_fail = MessageBuilder::new(&mut self.write_buffer, COPY_FAIL);
                copy_fail.write_cstr("COPY FROM STDIN is not supported by this client");
                copy_fail.finish();
                Ok(Action::WriteAndReadMessage)
            }
            msg_type::ERROR_RESPONSE => {
                let error = ErrorResponse::parse(msg.payload)?;
                self.error = Some((self.results.len(), error.0));
                Ok(Action::ReadMessage)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.finished = true;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message in query response: '{}'",
                other as char
            ))),
        }
    }

    fn finish_result(&mut self, tag: &str) {
        let columns = self.columns.take().unwrap_or_else(|| Arc::from(Vec::new()));
        let rows = std::mem::take(&mut self.rows);
        self.results.push(QueryResult::new(columns, rows, tag));
    }

    /// Consume the machine. On failure returns the index of the statement the
    /// server rejected together with the server's error.
    pub fn finish(self) -> std::result::Result<Vec<QueryResult>, (usize, ServerError)> {
        match self.error {
            Some(failure) => Err(failure),
            None => Ok(self.results),
        }
    }
}
