//! Simple and extended query protocol messages.
//!
//! Parameters and results always travel in text format; parameter types are
//! left for the server to infer.

use crate::protocol::codec::MessageBuilder;
use crate::value::Value;

use super::msg_type;

/// Write a Query message.
///
/// The query string may contain multiple SQL statements separated by semicolons.
pub fn write_query(buf: &mut Vec<u8>, query: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::QUERY);
    msg.write_cstr(query);
    msg.finish();
}

/// Write a Parse message. An empty `name` targets the unnamed statement.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(0);
    msg.finish();
}

/// Write a Bind message binding `params` to the unnamed portal.
pub fn write_bind(buf: &mut Vec<u8>, statement: &str, params: &[Value]) {
    let mut msg = MessageBuilder::new(buf, msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr(statement);

    // zero format codes: every parameter is text
    msg.write_i16(0);
    msg.write_i16(params.len() as i16);
    for param in params {
        match param.to_text() {
            None => msg.write_i32(-1),
            Some(text) => {
                msg.write_i32(text.len() as i32);
                msg.write_bytes(text.as_bytes());
            }
        }
    }

    // zero result format codes: every column is text
    msg.write_i16(0);
    msg.finish();
}

/// Write a Describe message for the unnamed portal.
pub fn write_describe_portal(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr("");
    msg.finish();
}

/// Write an Execute message for the unnamed portal with no row limit.
pub fn write_execute(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::new(buf, msg_type::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish();
}

/// Write a Close message releasing a named prepared statement.
pub fn write_close_statement(buf: &mut Vec<u8>, name: &str) {
    let mut msg = MessageBuilder::new(buf, msg_type::CLOSE);
    msg.write_u8(b'S');
    msg.write_cstr(name);
    msg.finish();
}

/// Write a Sync message.
///
/// Ends an extended query sequence; the server answers with ReadyForQuery.
/// Statements since the previous Sync run in one implicit transaction.
pub fn write_sync(buf: &mut Vec<u8>) {
    MessageBuilder::new(buf, msg_type::SYNC).finish();
}
