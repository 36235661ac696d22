//! Connection startup and authentication state machine.

use crate::error::{Error, Result};
use crate::opts::{ChannelBinding, Opts, SslMode};
use crate::protocol::RawMessage;
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ErrorResponse, ParameterStatus, ReadyForQuery, msg_type,
};
use crate::protocol::frontend::auth::{
    SCRAM_SHA_256, SCRAM_SHA_256_PLUS, ScramBinding, ScramClient, md5_password,
};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_ssl_request,
    write_startup,
};
use crate::protocol::types::TransactionStatus;

use super::action::{Action, AsyncMessage};

/// Connection state during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Initial,
    WaitingSslResponse,
    SslHandshake,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// Connection startup state machine.
pub struct StartupStateMachine {
    state: StartupState,
    options: Opts,
    tls_available: bool,
    channel_binding: Option<Vec<u8>>,
    backend_pid: Option<u32>,
    server_params: Vec<(String, String)>,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
    write_buffer: Vec<u8>,
}

impl StartupStateMachine {
    /// Create a new startup state machine. `tls_available` tells whether the
    /// caller can perform a TLS handshake at all.
    pub fn new(options: Opts, tls_available: bool) -> Self {
        Self {
            state: StartupState::Initial,
            options,
            tls_available,
            channel_binding: None,
            backend_pid: None,
            server_params: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
            write_buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> StartupState {
        self.state
    }

    /// Bytes to send for the last `Write*` action.
    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    pub fn backend_pid(&self) -> Option<u32> {
        self.backend_pid
    }

    pub fn server_params(&self) -> &[(String, String)] {
        &self.server_params
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Start the connection process.
    pub fn start(&mut self) -> Result<Action> {
        self.write_buffer.clear();

        match self.options.ssl_mode {
            SslMode::Require if !self.tls_available => {
                self.state = StartupState::Failed;
                Err(Error::Connection(
                    "sslmode=require but TLS support is not compiled in".into(),
                ))
            }
            SslMode::Prefer | SslMode::Require if self.tls_available => {
                write_ssl_request(&mut self.write_buffer);
                self.state = StartupState::WaitingSslResponse;
                Ok(Action::WriteAndReadByte)
            }
            _ => {
                self.write_startup_message();
                self.state = StartupState::WaitingAuth;
                Ok(Action::WriteAndReadMessage)
            }
        }
    }

    /// Process SSL response byte ('S' or 'N').
    pub fn process_ssl_response(&mut self, response: u8) -> Result<Action> {
        match response {
            b'S' => {
                self.state = StartupState::SslHandshake;
                Ok(Action::TlsHandshake)
            }
            b'N' => {
                if self.options.ssl_mode == SslMode::Require {
                    self.state = StartupState::Failed;
                    return Err(Error::Connection(
                        "SSL required but not supported by server".into(),
                    ));
                }
                self.write_buffer.clear();
                self.write_startup_message();
                self.state = StartupState::WaitingAuth;
                Ok(Action::WriteAndReadMessage)
            }
            _ => {
                self.state = StartupState::Failed;
                Err(Error::Protocol(format!(
                    "Unexpected SSL response: {}",
                    response
                )))
            }
        }
    }

    /// Called after the TLS handshake, with the `tls-server-end-point`
    /// channel binding data when the certificate allows it.
    pub fn tls_handshake_complete(&mut self, channel_binding: Option<Vec<u8>>) -> Action {
        self.channel_binding = channel_binding;
        self.write_buffer.clear();
        self.write_startup_message();
        self.state = StartupState::WaitingAuth;
        Action::WriteAndReadMessage
    }

    /// Process a message from the server.
    pub fn step(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        if msg.is_async() {
            let async_msg = AsyncMessage::parse(&msg)?;
            if let AsyncMessage::ParameterChanged { name, value } = &async_msg {
                self.server_params.push((name.clone(), value.clone()));
            }
            return Ok(Action::HandleAsyncMessageAndReadMessage(async_msg));
        }

        if msg.type_byte == msg_type::ERROR_RESPONSE {
            let error = ErrorResponse::parse(msg.payload)?;
            self.state = StartupState::Failed;
            return Err(error.into_error());
        }

        match self.state {
            StartupState::WaitingAuth => self.handle_auth_message(msg),
            StartupState::SaslInProgress => self.handle_sasl_message(msg),
            StartupState::WaitingAuthResult => self.handle_auth_result(msg),
            StartupState::WaitingReady => self.handle_ready_message(msg),
            _ => Err(Error::Protocol(format!(
                "Unexpected message in state {:?}",
                self.state
            ))),
        }
    }

    fn write_startup_message(&mut self) {
        let mut params: Vec<(&str, &str)> =
            vec![("user", &self.options.user), ("client_encoding", "UTF8")];

        if let Some(db) = &self.options.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.options.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.options.params {
            params.push((name, value));
        }

        write_startup(&mut self.write_buffer, &params);
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("Password required but not provided".into()))
    }

    fn expect_auth<'a>(&self, msg: &RawMessage<'a>) -> Result<AuthenticationMessage<'a>> {
        if msg.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                msg.type_byte as char
            )));
        }
        AuthenticationMessage::parse(msg.payload)
    }

    fn handle_auth_message(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        let auth = self.expect_auth(&msg)?;

        if self.options.channel_binding == ChannelBinding::Require
            && !matches!(auth, AuthenticationMessage::Sasl { .. })
        {
            return Err(Error::Auth(
                "channel_binding=require but the server did not request SCRAM authentication"
                    .into(),
            ));
        }

        match auth {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            AuthenticationMessage::CleartextPassword => {
                let password = self.password()?.to_string();
                self.write_buffer.clear();
                write_password(&mut self.write_buffer, &password);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                self.write_buffer.clear();
                write_password(&mut self.write_buffer, &hashed);
                self.state = StartupState::WaitingAuthResult;
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                let binding = self.choose_binding(&mechanisms)?;
                let scram = ScramClient::new(self.password()?, binding);
                let client_first = scram.client_first_message();

                self.write_buffer.clear();
                write_sasl_initial_response(
                    &mut self.write_buffer,
                    scram.mechanism(),
                    client_first.as_bytes(),
                );
                self.scram_client = Some(scram);
                self.state = StartupState::SaslInProgress;
                Ok(Action::WriteAndReadMessage)
            }
            other => Err(Error::Auth(format!(
                "Unsupported authentication method: {:?}",
                other
            ))),
        }
    }

    fn choose_binding(&self, mechanisms: &[&str]) -> Result<ScramBinding> {
        let offers_plus = mechanisms.contains(&SCRAM_SHA_256_PLUS);
        let offers_plain = mechanisms.contains(&SCRAM_SHA_256);

        let binding = match (self.options.channel_binding, &self.channel_binding) {
            (ChannelBinding::Disable, _) => ScramBinding::None,
            (_, Some(data)) if offers_plus => ScramBinding::TlsServerEndPoint(data.clone()),
            (ChannelBinding::Require, _) => {
                return Err(Error::Auth(
                    "channel_binding=require but SCRAM-SHA-256-PLUS over TLS is not available"
                        .into(),
                ));
            }
            (ChannelBinding::Prefer, Some(_)) => ScramBinding::NotOffered,
            (ChannelBinding::Prefer, None) => ScramBinding::None,
        };

        if !matches!(binding, ScramBinding::TlsServerEndPoint(_)) && !offers_plain {
            return Err(Error::Auth(format!(
                "No supported SASL mechanism. Server offers: {:?}",
                mechanisms
            )));
        }
        Ok(binding)
    }

    fn handle_sasl_message(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        let auth = self.expect_auth(&msg)?;
        let scram = self
            .scram_client
            .as_mut()
            .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;

        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-first-message: {}", e)))?;
                let client_final = scram
                    .process_server_first(server_first)
                    .map_err(Error::Auth)?;

                self.write_buffer.clear();
                write_sasl_response(&mut self.write_buffer, client_final.as_bytes());
                Ok(Action::WriteAndReadMessage)
            }
            AuthenticationMessage::SaslFinal { data } => {
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Auth(format!("Invalid server-final-message: {}", e)))?;
                scram
                    .verify_server_final(server_final)
                    .map_err(Error::Auth)?;

                self.state = StartupState::WaitingAuthResult;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected SASL message: {:?}",
                other
            ))),
        }
    }

    fn handle_auth_result(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match self.expect_auth(&msg)? {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Action::ReadMessage)
            }
            other => Err(Error::Auth(format!("Unexpected auth result: {:?}", other))),
        }
    }

    fn handle_ready_message(&mut self, msg: RawMessage<'_>) -> Result<Action> {
        match msg.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                self.backend_pid = Some(BackendKeyData::parse(msg.payload)?.process_id());
                Ok(Action::ReadMessage)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                self.server_params
                    .push((param.name.to_string(), param.value.to_string()));
                Ok(Action::ReadMessage)
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => Ok(Action::ReadMessage),
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(msg.payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = StartupState::Ready;
                Ok(Action::Finished)
            }
            other => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                other as char
            ))),
        }
    }
}
