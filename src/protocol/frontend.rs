//! PostgreSQL frontend (client → server) messages.

use crate::error::{Result, check_cast};
use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::FormatCode;

/// Protocol version 3.0 (0x00030000)
pub const PROTOCOL_VERSION_3_0: i32 = 196608;

/// Cancel request code
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Frontend message type bytes.
pub mod msg_type {
    /// Password/SASL response (all auth response types use 'p')
    pub const PASSWORD: u8 = b'p';
    /// Query (simple query protocol)
    pub const QUERY: u8 = b'Q';
    /// Parse (extended query protocol)
    pub const PARSE: u8 = b'P';
    /// Bind (extended query protocol)
    pub const BIND: u8 = b'B';
    /// Execute (extended query protocol)
    pub const EXECUTE: u8 = b'E';
    /// Describe (extended query protocol)
    pub const DESCRIBE: u8 = b'D';
    /// Sync (extended query protocol)
    pub const SYNC: u8 = b'S';
    /// CopyData
    pub const COPY_DATA: u8 = b'd';
    /// CopyDone
    pub const COPY_DONE: u8 = b'c';
    /// CopyFail
    pub const COPY_FAIL: u8 = b'f';
    /// Terminate
    pub const TERMINATE: u8 = b'X';
}

/// Write a StartupMessage.
///
/// Parameters is a list of (name, value) pairs; "user" is required.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) -> Result<()> {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(PROTOCOL_VERSION_3_0);
    for (name, value) in params {
        msg.write_cstr(name);
        msg.write_cstr(value);
    }
    msg.write_u8(0);
    msg.finish()
}

/// Write a CancelRequest message.
///
/// This is sent on a NEW connection to cancel a query running on another connection.
/// The server closes the connection immediately with no response.
pub fn write_cancel_request(buf: &mut Vec<u8>, pid: u32, secret_key: u32) -> Result<()> {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(CANCEL_REQUEST_CODE);
    msg.write_i32(pid as i32);
    msg.write_i32(secret_key as i32);
    msg.finish()
}

/// Write a Terminate message.
pub fn write_terminate(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, msg_type::TERMINATE).finish()
}

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish()
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(
    buf: &mut Vec<u8>,
    mechanism: &str,
    initial_response: &[u8],
) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(check_cast(initial_response.len(), "SASL response length")?);
    msg.write_bytes(initial_response);
    msg.finish()
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish()
}

/// Write a Query message.
pub fn write_query(buf: &mut Vec<u8>, query: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::QUERY);
    msg.write_cstr(query);
    msg.finish()
}

/// Write a Parse message with server-inferred parameter types.
pub fn write_parse(buf: &mut Vec<u8>, name: &str, query: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::PARSE);
    msg.write_cstr(name);
    msg.write_cstr(query);
    msg.write_i16(0);
    msg.finish()
}

/// Write a Bind message for the unnamed portal.
///
/// Each value is written with its own format code; `None` is SQL NULL.
/// Results are always requested in text format.
pub fn write_bind(
    buf: &mut Vec<u8>,
    statement: &str,
    values: &[(Option<&[u8]>, FormatCode)],
) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::BIND);
    msg.write_cstr("");
    msg.write_cstr(statement);

    let count: u16 = check_cast(values.len(), "Too many parameters")?;
    msg.write_u16(count);
    for (_, format) in values {
        msg.write_i16(*format as i16);
    }

    msg.write_u16(count);
    for (value, _) in values {
        match value {
            Some(bytes) => {
                msg.write_i32(check_cast(bytes.len(), "Parameter length")?);
                msg.write_bytes(bytes);
            }
            None => msg.write_i32(-1),
        }
    }

    msg.write_i16(1);
    msg.write_i16(FormatCode::Text as i16);
    msg.finish()
}

/// Write a Describe message for the unnamed portal.
pub fn write_describe_portal(buf: &mut Vec<u8>) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::DESCRIBE);
    msg.write_u8(b'P');
    msg.write_cstr("");
    msg.finish()
}

/// Write an Execute message for the unnamed portal, fetching all rows.
pub fn write_execute(buf: &mut Vec<u8>) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::EXECUTE);
    msg.write_cstr("");
    msg.write_i32(0);
    msg.finish()
}

/// Write a Sync message.
pub fn write_sync(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, msg_type::SYNC).finish()
}

/// Write a CopyData message.
pub fn write_copy_data(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::COPY_DATA);
    msg.write_bytes(data);
    msg.finish()
}

/// Write a CopyDone message.
pub fn write_copy_done(buf: &mut Vec<u8>) -> Result<()> {
    MessageBuilder::new(buf, msg_type::COPY_DONE).finish()
}

/// Write a CopyFail message.
pub fn write_copy_fail(buf: &mut Vec<u8>, error_message: &str) -> Result<()> {
    let mut msg = MessageBuilder::new(buf, msg_type::COPY_FAIL);
    msg.write_cstr(error_message);
    msg.finish()
}
