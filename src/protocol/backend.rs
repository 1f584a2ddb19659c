//! PostgreSQL backend (server → client) messages.

use zerocopy::byteorder::big_endian::{I16 as I16BE, I32 as I32BE, U16 as U16BE, U32 as U32BE};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::encoding::EncodingGroup;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::codec::{read_cstr, read_cstring, read_i32, read_u8, read_u16, read_u32};
use crate::protocol::types::{FormatCode, Oid, TransactionStatus};

/// Backend message type bytes.
pub mod msg_type {
    /// Authentication message
    pub const AUTHENTICATION: u8 = b'R';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// RowDescription
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// EmptyQueryResponse
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// NotificationResponse
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    /// ParseComplete
    pub const PARSE_COMPLETE: u8 = b'1';
    /// BindComplete
    pub const BIND_COMPLETE: u8 = b'2';
    /// CloseComplete
    pub const CLOSE_COMPLETE: u8 = b'3';
    /// ParameterDescription
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    /// NoData
    pub const NO_DATA: u8 = b'n';
    /// PortalSuspended
    pub const PORTAL_SUSPENDED: u8 = b's';
    /// CopyInResponse
    pub const COPY_IN_RESPONSE: u8 = b'G';
    /// CopyOutResponse
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    /// CopyBothResponse
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    /// CopyData
    pub const COPY_DATA: u8 = b'd';
    /// CopyDone
    pub const COPY_DONE: u8 = b'c';
    /// NegotiateProtocolVersion
    pub const NEGOTIATE_PROTOCOL_VERSION: u8 = b'v';
}

/// Authentication method constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const KERBEROS_V5: i32 = 2;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const GSS: i32 = 7;
    pub const SSPI: i32 = 9;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Authentication message from the server.
#[derive(Debug)]
pub enum AuthenticationMessage<'a> {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required (with 4-byte salt)
    Md5Password { salt: [u8; 4] },
    /// SASL authentication required (with list of mechanisms)
    Sasl { mechanisms: Vec<&'a str> },
    /// SASL continue (with server-first-message)
    SaslContinue { data: &'a [u8] },
    /// SASL final (with server-final-message)
    SaslFinal { data: &'a [u8] },
    /// Kerberos, GSSAPI or SSPI; not supported by this crate
    Unsupported(i32),
}

impl<'a> AuthenticationMessage<'a> {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (auth_type, rest) = read_i32(payload)?;

        match auth_type {
            auth_type::OK => Ok(AuthenticationMessage::Ok),
            auth_type::CLEARTEXT_PASSWORD => Ok(AuthenticationMessage::CleartextPassword),
            auth_type::MD5_PASSWORD => match rest.first_chunk::<4>() {
                Some(salt) => Ok(AuthenticationMessage::Md5Password { salt: *salt }),
                None => Err(Error::Protocol("MD5Password: missing salt".into())),
            },
            auth_type::SASL => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                while data.first().is_some_and(|&b| b != 0) {
                    let (mechanism, remaining) = read_cstr(data)?;
                    mechanisms.push(mechanism);
                    data = remaining;
                }
                Ok(AuthenticationMessage::Sasl { mechanisms })
            }
            auth_type::SASL_CONTINUE => Ok(AuthenticationMessage::SaslContinue { data: rest }),
            auth_type::SASL_FINAL => Ok(AuthenticationMessage::SaslFinal { data: rest }),
            auth_type::KERBEROS_V5 | auth_type::GSS | auth_type::SSPI => {
                Ok(AuthenticationMessage::Unsupported(auth_type))
            }
            _ => Err(Error::Protocol(format!(
                "Unknown authentication type: {auth_type}"
            ))),
        }
    }
}

/// BackendKeyData message - contains process ID and secret key for cancellation.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct BackendKeyData {
    /// Process ID of the backend
    pub pid: U32BE,
    /// Secret key for cancellation
    pub secret_key: U32BE,
}

impl BackendKeyData {
    /// Parse a BackendKeyData message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Ok(Self::ref_from_bytes(payload)?)
    }

    /// Get the process ID.
    pub fn process_id(&self) -> u32 {
        self.pid.get()
    }

    /// Get the secret key.
    pub fn secret(&self) -> u32 {
        self.secret_key.get()
    }
}

/// ParameterStatus message - server parameter name and value.
///
/// Both are raw bytes in the client encoding.
#[derive(Debug, Clone)]
pub struct ParameterStatus<'a> {
    /// Parameter name
    pub name: &'a [u8],
    /// Parameter value
    pub value: &'a [u8],
}

impl<'a> ParameterStatus<'a> {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (name, rest) = read_cstring(payload)?;
        let (value, _) = read_cstring(rest)?;
        Ok(Self { name, value })
    }
}

/// ReadyForQuery message - indicates server is ready for a new query.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct ReadyForQuery {
    /// Transaction status byte
    pub status: u8,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<&Self> {
        Ok(Self::ref_from_bytes(payload)?)
    }

    /// Get the transaction status.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        TransactionStatus::from_byte(self.status)
    }
}

/// NotificationResponse message - asynchronous notification from LISTEN/NOTIFY.
#[derive(Debug, Clone)]
pub struct NotificationResponse<'a> {
    /// PID of the notifying backend
    pub pid: u32,
    /// Channel name, in the client encoding
    pub channel: &'a [u8],
    /// Notification payload, in the client encoding
    pub payload: &'a [u8],
}

impl<'a> NotificationResponse<'a> {
    /// Parse a NotificationResponse message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (pid, rest) = read_u32(payload)?;
        let (channel, rest) = read_cstring(rest)?;
        let (payload_bytes, _) = read_cstring(rest)?;
        Ok(Self {
            pid,
            channel,
            payload: payload_bytes,
        })
    }
}

/// Error field type codes from PostgreSQL protocol.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_NON_LOCALIZED: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const CONSTRAINT: u8 = b'n';
    /// Fields this crate reads past without keeping.
    pub const SKIPPED: &[u8] = b"pqdFLR";
}

/// Parse ErrorResponse/NoticeResponse fields from payload, decoding text
/// in the client encoding `enc`.
pub fn parse_error_fields(payload: &[u8], enc: EncodingGroup) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    while let Some((&code, rest)) = data.split_first() {
        if code == 0 {
            break;
        }
        let (raw, rest) = read_cstring(rest)?;
        data = rest;
        let value = enc.decode_lossy(raw);

        let slot = match code {
            field_type::SEVERITY => &mut fields.severity,
            field_type::SEVERITY_NON_LOCALIZED => &mut fields.severity_non_localized,
            field_type::CODE => &mut fields.code,
            field_type::MESSAGE => &mut fields.message,
            field_type::DETAIL => &mut fields.detail,
            field_type::HINT => &mut fields.hint,
            field_type::WHERE => &mut fields.where_,
            field_type::SCHEMA => &mut fields.schema,
            field_type::TABLE => &mut fields.table,
            field_type::COLUMN => &mut fields.column,
            field_type::CONSTRAINT => &mut fields.constraint,
            field_type::POSITION => {
                fields.position = value.parse().ok();
                continue;
            }
            c if field_type::SKIPPED.contains(&c) => continue,
            _ => {
                tracing::debug!("Unknown error field type: {}", code as char);
                continue;
            }
        };
        *slot = Some(value.into_owned());
    }

    Ok(fields)
}

/// Fixed-size tail of a field description (18 bytes).
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
pub struct FieldDescriptionTail {
    /// Table OID (0 if not a table column)
    pub table_oid: U32BE,
    /// Column attribute number (0 if not a table column)
    pub column_id: I16BE,
    /// Data type OID
    pub type_oid: U32BE,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: I16BE,
    /// Type modifier (type-specific)
    pub type_modifier: I32BE,
    /// Format code (0=text, 1=binary)
    pub format: U16BE,
}

/// Column name and type as announced by a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: Oid,
    /// Format code of the values in this column
    pub format: FormatCode,
}

/// Parse a RowDescription message into owned column descriptions.
pub fn parse_row_description(payload: &[u8], enc: EncodingGroup) -> Result<Vec<ColumnInfo>> {
    let (num_fields, mut data) = read_u16(payload)?;
    let mut columns = Vec::with_capacity(num_fields as usize);
    for _ in 0..num_fields {
        let (name, rest) = read_cstring(data)?;
        let (tail, rest) = FieldDescriptionTail::ref_from_prefix(rest)
            .map_err(|e| Error::Protocol(format!("FieldDescription tail: {e:?}")))?;
        columns.push(ColumnInfo {
            name: enc.decode_lossy(name).into_owned(),
            type_oid: tail.type_oid.get(),
            format: FormatCode::from_u16(tail.format.get()),
        });
        data = rest;
    }
    Ok(columns)
}

/// DataRow message - contains a single row of data.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, columns_data) = read_u16(payload)?;
        Ok(Self {
            num_columns,
            columns_data,
        })
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Create an iterator over column values.
    ///
    /// Each item is `Option<&[u8]>` where `None` represents NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }

    /// Copy every column value out of the message.
    pub fn to_owned_values(&self) -> Result<Vec<Option<Vec<u8>>>> {
        let values: Vec<_> = self.iter().map(|v| v.map(<[u8]>::to_vec)).collect();
        if values.len() != self.len() {
            return Err(Error::Protocol(format!(
                "DataRow: expected {} columns, decoded {}",
                self.len(),
                values.len()
            )));
        }
        Ok(values)
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let len;
        (len, self.remaining) = self.remaining.split_first_chunk::<4>()?;
        let len = i32::from_be_bytes(*len);

        if len == -1 {
            return Some(None);
        }
        let value;
        (value, self.remaining) = self.remaining.split_at_checked(usize::try_from(len).ok()?)?;
        Some(Some(value))
    }
}

/// CommandComplete message - indicates successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }
}

/// Parse the number of rows affected from a command tag.
///
/// Returns `None` for commands that carry no count.
pub fn rows_affected(tag: &str) -> Option<u64> {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _oid, count] => count.parse().ok(),
        ["SELECT" | "UPDATE" | "DELETE" | "COPY" | "MOVE" | "FETCH" | "MERGE", count] => {
            count.parse().ok()
        }
        _ => None,
    }
}

/// CopyInResponse / CopyOutResponse body.
#[derive(Debug, Clone)]
pub struct CopyResponse {
    /// Overall format (0=text, 1=binary)
    pub format: FormatCode,
    /// Per-column format codes
    pub column_formats: Vec<FormatCode>,
}

impl CopyResponse {
    /// Parse a CopyInResponse or CopyOutResponse payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (format_byte, rest) = read_u8(payload)?;
        let (num_columns, mut rest) = read_u16(rest)?;
        let mut column_formats = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let (fmt, remaining) = read_u16(rest)?;
            column_formats.push(FormatCode::from_u16(fmt));
            rest = remaining;
        }
        Ok(Self {
            format: FormatCode::from_u16(format_byte as u16),
            column_formats,
        })
    }
}
