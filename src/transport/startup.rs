//! Connection startup and authentication state machine.
//!
//! Sans-I/O: the caller feeds complete backend messages to [`Startup::step`]
//! and writes out whatever the machine appended to the output buffer.

use crate::encoding::EncodingGroup;
use crate::error::{Error, ErrorFields, Result};
use crate::opts::Opts;
use crate::protocol::auth::{SCRAM_SHA_256, ScramClient, md5_password};
use crate::protocol::backend::{
    AuthenticationMessage, BackendKeyData, ParameterStatus, ReadyForQuery, msg_type,
    parse_error_fields,
};
use crate::protocol::frontend::{
    write_password, write_sasl_initial_response, write_sasl_response, write_startup,
};
use crate::protocol::types::TransactionStatus;

/// Startup progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartupState {
    Initial,
    WaitingAuth,
    SaslInProgress,
    WaitingAuthResult,
    WaitingReady,
    Ready,
    Failed,
}

/// What the caller should do after a step.
#[derive(Debug)]
pub(crate) enum Step {
    /// Flush any output, then feed the next message.
    Continue,
    /// Deliver a server notice, then feed the next message.
    Notice(ErrorFields),
    /// The session is ready for queries.
    Finished,
}

pub(crate) struct Startup {
    state: StartupState,
    options: Opts,
    backend_key: Option<(u32, u32)>,
    server_params: Vec<(String, String)>,
    text_encoding: EncodingGroup,
    transaction_status: TransactionStatus,
    scram_client: Option<ScramClient>,
}

impl Startup {
    pub(crate) fn new(options: Opts) -> Self {
        let text_encoding = EncodingGroup::for_client_encoding(&options.client_encoding);
        Self {
            state: StartupState::Initial,
            options,
            backend_key: None,
            server_params: Vec::new(),
            text_encoding,
            transaction_status: TransactionStatus::Idle,
            scram_client: None,
        }
    }

    pub(crate) fn state(&self) -> StartupState {
        self.state
    }

    /// Process ID and secret key, once the server sent them.
    pub(crate) fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    pub(crate) fn take_server_params(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.server_params)
    }

    pub(crate) fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Append the startup packet to `out`.
    pub(crate) fn start(&mut self, out: &mut Vec<u8>) -> Result<()> {
        let mut params: Vec<(&str, &str)> = vec![
            ("user", &self.options.user),
            ("client_encoding", &self.options.client_encoding),
        ];
        if let Some(db) = &self.options.database {
            params.push(("database", db));
        }
        if let Some(app) = &self.options.application_name {
            params.push(("application_name", app));
        }
        for (name, value) in &self.options.params {
            params.push((name, value));
        }
        write_startup(out, &params)?;
        self.state = StartupState::WaitingAuth;
        tracing::debug!(user = %self.options.user, "sent startup packet");
        Ok(())
    }

    /// Feed one backend message; replies are appended to `out`.
    pub(crate) fn step(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Step> {
        let result = self.dispatch(type_byte, payload, out);
        if result.is_err() {
            self.state = StartupState::Failed;
        }
        result
    }

    fn dispatch(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Step> {
        match type_byte {
            msg_type::ERROR_RESPONSE => {
                let fields = parse_error_fields(payload, self.text_encoding)?;
                return Err(Error::Sql {
                    fields,
                    query: "[connect]".into(),
                });
            }
            msg_type::NOTICE_RESPONSE => {
                return Ok(Step::Notice(parse_error_fields(payload, self.text_encoding)?));
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                let enc = self.text_encoding;
                self.set_param(&enc.decode_lossy(param.name), &enc.decode_lossy(param.value));
                return Ok(Step::Continue);
            }
            msg_type::NEGOTIATE_PROTOCOL_VERSION => {
                tracing::debug!("server negotiated protocol version");
                return Ok(Step::Continue);
            }
            _ => {}
        }

        match self.state {
            StartupState::WaitingAuth => self.handle_auth_message(type_byte, payload, out),
            StartupState::SaslInProgress => self.handle_sasl_message(type_byte, payload, out),
            StartupState::WaitingAuthResult => self.handle_auth_result(type_byte, payload),
            StartupState::WaitingReady => self.handle_ready_message(type_byte, payload),
            _ => Err(Error::Protocol(format!(
                "Unexpected message '{}' in startup state {:?}",
                type_byte as char, self.state
            ))),
        }
    }

    fn set_param(&mut self, name: &str, value: &str) {
        if name == "client_encoding" {
            self.text_encoding = EncodingGroup::for_client_encoding(value);
        }
        if let Some(entry) = self.server_params.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value.to_string();
        } else {
            self.server_params.push((name.to_string(), value.to_string()));
        }
    }

    fn password(&self) -> Result<&str> {
        self.options
            .password
            .as_deref()
            .ok_or_else(|| Error::BrokenConnection("Password required but not provided".into()))
    }

    fn expect_auth(type_byte: u8) -> Result<()> {
        if type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "Expected Authentication message, got '{}'",
                type_byte as char
            )));
        }
        Ok(())
    }

    fn handle_auth_message(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Step> {
        Self::expect_auth(type_byte)?;
        let auth = AuthenticationMessage::parse(payload)?;

        match auth {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
            }
            AuthenticationMessage::CleartextPassword => {
                write_password(out, self.password()?)?;
                self.state = StartupState::WaitingAuthResult;
            }
            AuthenticationMessage::Md5Password { salt } => {
                let hashed = md5_password(&self.options.user, self.password()?, &salt);
                write_password(out, &hashed)?;
                self.state = StartupState::WaitingAuthResult;
            }
            AuthenticationMessage::Sasl { mechanisms } => {
                if !mechanisms.contains(&SCRAM_SHA_256) {
                    return Err(Error::FeatureNotSupported(format!(
                        "No supported SASL mechanism. Server offers: {mechanisms:?}"
                    )));
                }
                let scram = ScramClient::new(self.password()?);
                write_sasl_initial_response(
                    out,
                    SCRAM_SHA_256,
                    scram.client_first_message().as_bytes(),
                )?;
                self.scram_client = Some(scram);
                self.state = StartupState::SaslInProgress;
            }
            other => {
                return Err(Error::FeatureNotSupported(format!(
                    "Unsupported authentication method: {other:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }

    fn handle_sasl_message(&mut self, type_byte: u8, payload: &[u8], out: &mut Vec<u8>) -> Result<Step> {
        Self::expect_auth(type_byte)?;
        let auth = AuthenticationMessage::parse(payload)?;

        match auth {
            AuthenticationMessage::SaslContinue { data } => {
                let scram = self
                    .scram_client
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_first = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Protocol(format!("Invalid server-first-message: {e}")))?;
                let client_final = scram.process_server_first(server_first)?;
                write_sasl_response(out, client_final.as_bytes())?;
            }
            AuthenticationMessage::SaslFinal { data } => {
                let scram = self
                    .scram_client
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("SCRAM client not initialized".into()))?;
                let server_final = simdutf8::compat::from_utf8(data)
                    .map_err(|e| Error::Protocol(format!("Invalid server-final-message: {e}")))?;
                scram.verify_server_final(server_final)?;
                self.state = StartupState::WaitingAuthResult;
            }
            other => {
                return Err(Error::Protocol(format!("Unexpected SASL message: {other:?}")));
            }
        }
        Ok(Step::Continue)
    }

    fn handle_auth_result(&mut self, type_byte: u8, payload: &[u8]) -> Result<Step> {
        Self::expect_auth(type_byte)?;
        match AuthenticationMessage::parse(payload)? {
            AuthenticationMessage::Ok => {
                self.state = StartupState::WaitingReady;
                Ok(Step::Continue)
            }
            other => Err(Error::Protocol(format!("Unexpected auth result: {other:?}"))),
        }
    }

    fn handle_ready_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<Step> {
        match type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(payload)?;
                self.backend_key = Some((key.process_id(), key.secret()));
                Ok(Step::Continue)
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.state = StartupState::Ready;
                tracing::debug!("startup complete");
                Ok(Step::Finished)
            }
            _ => Err(Error::Protocol(format!(
                "Unexpected message during startup: '{}'",
                type_byte as char
            ))),
        }
    }
}
