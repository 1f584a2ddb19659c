//! The transport seam.
//!
//! [`Connection`](crate::Connection) drives everything through the
//! [`Transport`] trait: connection establishment, command submission, result
//! retrieval, COPY sub-protocol calls, notification draining and cancellation.
//! Return codes of the COPY calls follow the classic client-library contract
//! so the session layer can map them onto its own error kinds.
//!
//! [`WireTransport`] is the bundled implementation speaking protocol 3.0 over
//! TCP or a Unix socket.

mod cancel;
#[cfg(test)]
pub(crate) mod mock;
mod startup;
mod stream;
mod wire;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::ErrorFields;
use crate::notification::Notification;
use crate::protocol::backend::ColumnInfo;
use crate::protocol::types::FormatCode;

pub use cancel::CancelToken;
pub use wire::WireTransport;

/// Overall state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Session established and usable.
    Ok,
    /// Connection failed or was lost.
    Bad,
    /// Non-blocking establishment still running.
    InProgress,
}

/// Outcome of one non-blocking connection poll step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Establishment failed; see [`Transport::error_message`].
    Failed,
    /// Poll again once the socket is readable.
    Reading,
    /// Poll again once the socket is writable.
    Writing,
    /// Establishment finished.
    Ok,
    /// Obsolete intermediate state. Never expected from a conforming transport.
    Active,
}

/// Status of one raw result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyOut,
    CopyIn,
    BadResponse,
    FatalError,
}

impl ExecStatus {
    pub fn is_copy(self) -> bool {
        matches!(self, ExecStatus::CopyIn | ExecStatus::CopyOut)
    }
}

/// One server response, fully materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResult {
    pub status: ExecStatus,
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub command_tag: String,
    pub error: Option<ErrorFields>,
}

impl RawResult {
    /// An empty result with the given status.
    pub fn new(status: ExecStatus) -> Self {
        Self {
            status,
            columns: Vec::new(),
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
        }
    }

    /// A [`ExecStatus::FatalError`] result carrying the server's error fields.
    pub fn from_error(fields: ErrorFields) -> Self {
        Self {
            error: Some(fields),
            ..Self::new(ExecStatus::FatalError)
        }
    }

    /// A [`ExecStatus::CommandOk`] result with a command tag.
    pub fn command(tag: &str) -> Self {
        Self {
            command_tag: tag.to_string(),
            ..Self::new(ExecStatus::CommandOk)
        }
    }
}

/// Statement parameters, in order.
///
/// ```
/// use pg_session::Params;
///
/// let params = Params::new().text("alice").null().binary(vec![0xDE, 0xAD]);
/// assert_eq!(params.len(), 3);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    values: Vec<(Option<Vec<u8>>, FormatCode)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text-format value.
    pub fn text(mut self, value: impl Into<String>) -> Self {
        self.values
            .push((Some(value.into().into_bytes()), FormatCode::Text));
        self
    }

    /// Append a binary-format value.
    pub fn binary(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.values.push((Some(value.into()), FormatCode::Binary));
        self
    }

    /// Append SQL NULL.
    pub fn null(mut self) -> Self {
        self.values.push((None, FormatCode::Text));
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values with their format codes; `None` is NULL.
    pub fn iter(&self) -> impl Iterator<Item = (Option<&[u8]>, FormatCode)> {
        self.values.iter().map(|(v, f)| (v.as_deref(), *f))
    }
}

/// Callback receiving formatted server notices.
pub type NoticeProcessor = Box<dyn FnMut(&str) + Send>;

/// What the session layer needs from the underlying client transport.
pub trait Transport {
    fn status(&self) -> ConnStatus;

    /// Advance non-blocking establishment by one step.
    fn poll_connect(&mut self) -> PollingStatus;

    /// Frontend/backend protocol major version, 0 if not connected.
    fn protocol_version(&self) -> i32;

    /// Server version as `major * 10000 + minor` (`90603` for 9.6.3), 0 if unknown.
    fn server_version(&self) -> i32;

    /// Backend process ID, 0 if not connected.
    fn backend_pid(&self) -> u32;

    /// Most recent error text.
    fn error_message(&self) -> &str;

    /// Current client encoding name, `None` if the transport cannot tell
    /// (typically because the connection is gone).
    fn client_encoding(&self) -> Option<&str>;

    fn db_name(&self) -> &str;
    fn user_name(&self) -> &str;
    fn host(&self) -> &str;
    fn port(&self) -> u16;

    /// Queue a simple-protocol command. `false` if it could not be sent.
    fn send_query(&mut self, query: &str) -> bool;

    /// Queue a parameterized command on the unnamed statement.
    fn send_query_params(&mut self, query: &str, params: &Params) -> bool;

    /// Queue creation of a named prepared statement.
    fn send_prepare(&mut self, name: &str, query: &str) -> bool;

    /// Queue execution of a named prepared statement.
    fn send_query_prepared(&mut self, name: &str, params: &Params) -> bool;

    /// Block for the next result of the current command; `None` once the
    /// command is complete or the connection is lost.
    fn get_result(&mut self) -> Option<RawResult>;

    /// Read one COPY OUT row into `buf`.
    ///
    /// Returns the row length (including its trailing newline), `-1` at the
    /// end of the copy, `-2` on error, `0` if no row is available yet.
    fn copy_read_line(&mut self, buf: &mut Vec<u8>) -> isize;

    /// Send COPY IN data: `1` queued, `0` would block, `-1` error.
    fn copy_put_data(&mut self, data: &[u8]) -> i32;

    /// End COPY IN, failing it with `error` if given: `1` sent, `0` would
    /// block, `-1` error.
    fn copy_put_end(&mut self, error: Option<&str>) -> i32;

    /// Read whatever the server has sent without blocking. `false` on
    /// connection trouble.
    fn consume_input(&mut self) -> bool;

    /// Whether [`get_result`](Self::get_result) would block.
    fn is_busy(&mut self) -> bool;

    /// Pop one buffered notification.
    fn next_notification(&mut self) -> Option<Notification>;

    /// Underlying socket descriptor, if any.
    fn socket(&self) -> Option<RawFd>;

    /// Wait up to `timeout` until a complete message can be consumed.
    /// `Ok(false)` on timeout.
    fn wait_readable(&mut self, timeout: Duration) -> std::io::Result<bool>;

    /// Route server notices to `processor` (or back to the default sink).
    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>);

    /// A handle that can cancel the running command from another thread.
    fn cancel_token(&self) -> Option<CancelToken>;

    /// Say goodbye to the server and release the socket.
    fn finish(&mut self);
}
