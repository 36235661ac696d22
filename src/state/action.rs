//! Action types for state machine I/O requests.

use crate::error::ServerError;
use crate::notify::Notification;

/// Action requested by a state machine.
///
/// The caller performs the requested I/O and then feeds the result back
/// into the state machine.
#[derive(Debug)]
pub enum Action {
    /// Write the machine's write buffer, then read a single byte.
    ///
    /// Used for SSL negotiation: write SSL request, then read response ('S' or 'N').
    WriteAndReadByte,

    /// Read the next message and pass it to `step()`.
    ReadMessage,

    /// Write the machine's write buffer, then read the next message.
    WriteAndReadMessage,

    /// Perform the TLS handshake, then report its completion.
    TlsHandshake,

    /// An asynchronous message arrived. Handle it, then read the next message.
    HandleAsyncMessageAndReadMessage(AsyncMessage),

    /// The state machine has finished.
    Finished,
}

/// Asynchronous message from the server.
///
/// These can arrive at any time, including between query cycles.
#[derive(Debug, Clone)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification(Notification),

    /// Non-fatal notice/warning from server.
    Notice(ServerError),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}

impl AsyncMessage {
    /// Decode an async message (NoticeResponse, NotificationResponse or ParameterStatus).
    pub fn parse(msg: &crate::protocol::RawMessage<'_>) -> crate::error::Result<Self> {
        use crate::protocol::backend::{
            NoticeResponse, NotificationResponse, ParameterStatus, msg_type,
        };

        match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                Ok(AsyncMessage::Notice(NoticeResponse::parse(msg.payload)?.0))
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let n = NotificationResponse::parse(msg.payload)?;
                Ok(AsyncMessage::Notification(Notification::new(
                    n.pid, n.channel, n.payload,
                )))
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                Ok(AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                })
            }
            other => Err(crate::error::Error::Protocol(format!(
                "Unknown async message type: '{}'",
                other as char
            ))),
        }
    }
}
