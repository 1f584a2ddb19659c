//! Protocol 3.0 transport over a TCP or Unix socket.
//!
//! After establishment the socket stays in blocking mode. Calls that must not
//! block ([`Transport::consume_input`]) switch it to non-blocking for their
//! duration; [`Transport::wait_readable`] uses a read timeout.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::encoding::EncodingGroup;
use crate::error::{Error, Result};
use crate::notification::Notification;
use crate::opts::{Opts, SslMode};
use crate::protocol::backend::{
    CommandComplete, CopyResponse, DataRow, NotificationResponse, ParameterStatus, ReadyForQuery,
    msg_type, parse_error_fields, parse_row_description,
};
use crate::protocol::codec::{read_i32, read_u8};
use crate::protocol::frontend::{
    write_bind, write_copy_data, write_copy_done, write_copy_fail, write_describe_portal,
    write_execute, write_parse, write_query, write_sync, write_terminate,
};
use crate::protocol::types::TransactionStatus;

use super::cancel::CancelToken;
use super::startup::{Startup, Step};
use super::stream::{Endpoint, Stream, is_would_block};
use super::{
    ConnStatus, ExecStatus, NoticeProcessor, Params, PollingStatus, RawResult, Transport,
};

const READ_CHUNK: usize = 8192;
const COPY_FLUSH_THRESHOLD: usize = 8192;
const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Where establishment stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the TCP connect to complete.
    Connecting,
    /// Running the startup/authentication exchange.
    Startup,
    /// Establishment is over, successfully or not.
    Done,
}

/// Command-level state once established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AsyncStatus {
    Idle,
    Busy,
    CopyIn,
    CopyOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Simple,
    Extended,
    Prepare,
}

/// Locate the next complete message at `pos`: its type byte and payload range.
fn frame_at(buf: &[u8], pos: usize) -> Result<Option<(u8, Range<usize>)>> {
    let Some(data) = buf.get(pos..) else {
        return Ok(None);
    };
    if data.len() < 5 {
        return Ok(None);
    }
    let (type_byte, rest) = read_u8(data)?;
    let (len, _) = read_i32(rest)?;
    let len = usize::try_from(len)
        .ok()
        .filter(|l| (4..MAX_MESSAGE_LEN).contains(l))
        .ok_or_else(|| Error::Protocol(format!("Invalid message length: {len}")))?;
    let end = pos + 1 + len;
    if end > buf.len() {
        return Ok(None);
    }
    Ok(Some((type_byte, pos + 5..end)))
}

/// `"16.2 (Debian 16.2-1)"` → `160002`, `"9.6.3"` → `90603`.
fn parse_server_version(text: &str) -> i32 {
    let numeric = text
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or("");
    let mut parts = numeric.split('.').map(|p| p.parse::<i32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    if major >= 10 {
        major * 10000 + minor
    } else {
        let patch = parts.next().unwrap_or(0);
        major * 10000 + minor * 100 + patch
    }
}

/// Plain-text rendering of a startup or I/O failure.
fn describe_error(err: &Error) -> String {
    match err {
        Error::Sql { fields, .. } => fields.to_notice_text().trim_end().to_string(),
        other => other.to_string(),
    }
}

/// The bundled [`Transport`].
pub struct WireTransport {
    opts: Opts,
    stream: Option<Stream>,
    endpoint: Option<Endpoint>,
    status: ConnStatus,
    phase: Phase,
    startup: Option<Startup>,
    deadline: Option<Instant>,

    in_buf: Vec<u8>,
    in_pos: usize,
    out_buf: Vec<u8>,

    async_status: AsyncStatus,
    query_kind: QueryKind,
    partial: Option<RawResult>,
    ready: VecDeque<RawResult>,
    notifications: VecDeque<Notification>,
    notice_processor: Option<NoticeProcessor>,

    server_params: Vec<(String, String)>,
    text_encoding: EncodingGroup,
    backend_key: Option<(u32, u32)>,
    transaction_status: TransactionStatus,
    error_message: String,
}

impl std::fmt::Debug for WireTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireTransport")
            .field("status", &self.status)
            .field("phase", &self.phase)
            .field("async_status", &self.async_status)
            .field("backend_key", &self.backend_key.map(|(pid, _)| pid))
            .finish_non_exhaustive()
    }
}

impl WireTransport {
    fn new(opts: Opts) -> Result<Self> {
        if opts.ssl_mode == SslMode::Require {
            return Err(Error::FeatureNotSupported(
                "sslmode=require: this build has no TLS support.".into(),
            ));
        }
        if opts.socket.is_none() && opts.host.is_empty() {
            return Err(Error::Usage("host is empty".into()));
        }
        let deadline = opts.connect_timeout.map(|t| Instant::now() + t);
        Ok(Self {
            opts,
            stream: None,
            endpoint: None,
            status: ConnStatus::InProgress,
            phase: Phase::Connecting,
            startup: None,
            deadline,
            in_buf: Vec::with_capacity(READ_CHUNK),
            in_pos: 0,
            out_buf: Vec::with_capacity(READ_CHUNK),
            async_status: AsyncStatus::Idle,
            query_kind: QueryKind::Simple,
            partial: None,
            ready: VecDeque::new(),
            notifications: VecDeque::new(),
            notice_processor: None,
            server_params: Vec::new(),
            text_encoding: EncodingGroup::Utf8,
            backend_key: None,
            transaction_status: TransactionStatus::Idle,
            error_message: String::new(),
        })
    }

    /// Connect and run startup to completion, blocking.
    ///
    /// Only invalid options are reported as `Err`; a failed connection
    /// attempt yields a transport whose status is [`ConnStatus::Bad`] and
    /// whose [`error_message`](Transport::error_message) says why.
    pub fn connect(opts: Opts) -> Result<Self> {
        let mut transport = Self::new(opts)?;
        let opened = match &transport.opts.socket {
            Some(path) => Stream::connect_unix(path),
            None => Stream::connect_tcp(
                &transport.opts.host,
                transport.opts.port,
                transport.opts.connect_timeout,
            ),
        };
        match opened {
            Ok(stream) => {
                if let Some(timeout) = transport.opts.connect_timeout
                    && let Err(e) = stream.set_read_timeout(Some(timeout))
                {
                    transport.fail(format!("could not set socket timeout: {e}"));
                    return Ok(transport);
                }
                transport.stream = Some(stream);
                transport.begin_startup();
            }
            Err(e) => {
                transport.fail(format!("could not connect to server: {e}"));
                return Ok(transport);
            }
        }

        while !matches!(
            transport.poll_connect(),
            PollingStatus::Ok | PollingStatus::Failed
        ) {}
        Ok(transport)
    }

    /// Start a non-blocking connection. Drive it with
    /// [`poll_connect`](Transport::poll_connect).
    pub fn connect_start(opts: Opts) -> Result<Self> {
        let mut transport = Self::new(opts)?;
        let opened = match &transport.opts.socket {
            Some(path) => Stream::connect_unix(path).and_then(|s| {
                s.set_nonblocking(true)?;
                Ok((s, true))
            }),
            None => Stream::connect_tcp_nonblocking(&transport.opts.host, transport.opts.port),
        };
        match opened {
            Ok((stream, connected)) => {
                transport.stream = Some(stream);
                if connected {
                    transport.begin_startup();
                }
            }
            Err(e) => transport.fail(format!("could not connect to server: {e}")),
        }
        Ok(transport)
    }

    /// Transaction status reported by the last ReadyForQuery.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Value of a server parameter reported through ParameterStatus.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn begin_startup(&mut self) {
        let mut startup = Startup::new(self.opts.clone());
        if let Err(e) = startup.start(&mut self.out_buf) {
            self.fail(format!("could not build startup packet: {e}"));
            return;
        }
        self.startup = Some(startup);
        self.phase = Phase::Startup;
        self.endpoint = self.stream.as_ref().and_then(|s| s.endpoint().ok());
    }

    fn fail(&mut self, message: String) {
        tracing::debug!(error = %message, "connection failed");
        self.error_message = message;
        self.status = ConnStatus::Bad;
        self.phase = Phase::Done;
        self.async_status = AsyncStatus::Idle;
        self.stream = None;
        self.startup = None;
        self.partial = None;
        self.out_buf.clear();
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn emit_notice(&mut self, text: &str) {
        match &mut self.notice_processor {
            Some(processor) => processor(text),
            None => tracing::debug!(notice = text.trim_end(), "server notice"),
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

    fn stream(&mut self) -> io::Result<&mut Stream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no connection to the server"))
    }

    /// Write out as much buffered output as the socket takes. `Ok(false)` if
    /// a non-blocking socket could not take all of it.
    fn flush_output(&mut self) -> io::Result<bool> {
        while !self.out_buf.is_empty() {
            let stream = self.stream.as_mut().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "no connection to the server")
            })?;
            match stream.write(&self.out_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.out_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        self.stream()?.flush()?;
        Ok(true)
    }

    /// Read one chunk from the socket into the input buffer.
    fn read_more(&mut self) -> io::Result<usize> {
        if self.in_pos > 0 {
            self.in_buf.drain(..self.in_pos);
            self.in_pos = 0;
        }
        let filled = self.in_buf.len();
        self.in_buf.resize(filled + READ_CHUNK, 0);
        let outcome = match self.stream.as_mut() {
            Some(stream) => stream.read(&mut self.in_buf[filled..]),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no connection to the server",
            )),
        };
        match outcome {
            Ok(0) => {
                self.in_buf.truncate(filled);
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection unexpectedly",
                ))
            }
            Ok(n) => {
                self.in_buf.truncate(filled + n);
                Ok(n)
            }
            Err(e) => {
                self.in_buf.truncate(filled);
                Err(e)
            }
        }
    }

    /// A whole message is buffered, or bytes that parsing will reject.
    fn has_buffered_message(&self) -> bool {
        !matches!(frame_at(&self.in_buf, self.in_pos), Ok(None))
    }

    fn finish_startup(&mut self) {
        if let Some(mut startup) = self.startup.take() {
            for (name, value) in startup.take_server_params() {
                self.set_param(&name, &value);
            }
            self.backend_key = startup.backend_key();
            self.transaction_status = startup.transaction_status();
        }
        let reset = self.stream.as_ref().map(|s| {
            s.set_nonblocking(false)
                .and_then(|()| s.set_read_timeout(None))
        });
        if let Some(Err(e)) = reset {
            self.fail(format!("could not configure socket: {e}"));
            return;
        }
        self.phase = Phase::Done;
        self.status = ConnStatus::Ok;
        self.async_status = AsyncStatus::Idle;
        tracing::debug!(
            pid = self.backend_pid(),
            server_version = self.server_version(),
            "connection established"
        );
    }

    fn drive_startup(&mut self) -> Result<PollingStatus> {
        loop {
            if !self.flush_output()? {
                return Ok(PollingStatus::Writing);
            }

            while let Some((type_byte, range)) = frame_at(&self.in_buf, self.in_pos)? {
                self.in_pos = range.end;
                let startup = self
                    .startup
                    .as_mut()
                    .ok_or_else(|| Error::Internal("startup state missing".into()))?;
                match startup.step(type_byte, &self.in_buf[range], &mut self.out_buf)? {
                    Step::Continue => {}
                    Step::Notice(fields) => self.emit_notice(&fields.to_notice_text()),
                    Step::Finished => {
                        self.finish_startup();
                        return Ok(if self.status == ConnStatus::Ok {
                            PollingStatus::Ok
                        } else {
                            PollingStatus::Failed
                        });
                    }
                }
                if !self.out_buf.is_empty() {
                    break;
                }
            }
            if !self.out_buf.is_empty() {
                continue;
            }

            if self.deadline_passed() {
                return Err(Error::BrokenConnection("timeout expired".into()));
            }
            match self.read_more() {
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(PollingStatus::Reading),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the handler for the message occupying `range`.
    fn dispatch_frame(&mut self, type_byte: u8, range: Range<usize>) -> Result<()> {
        self.in_pos = range.end;
        let buf = std::mem::take(&mut self.in_buf);
        let outcome = self.handle_message(type_byte, &buf[range]);
        self.in_buf = buf;
        outcome
    }

    /// Process every complete buffered message, stopping at COPY data.
    fn parse_input(&mut self) -> Result<()> {
        while let Some((type_byte, range)) = frame_at(&self.in_buf, self.in_pos)? {
            if self.async_status == AsyncStatus::CopyOut && type_byte == msg_type::COPY_DATA {
                break;
            }
            self.dispatch_frame(type_byte, range)?;
        }
        Ok(())
    }

    fn handle_message(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        match type_byte {
            msg_type::NOTICE_RESPONSE => {
                let fields = parse_error_fields(payload, self.text_encoding)?;
                self.emit_notice(&fields.to_notice_text());
                return Ok(());
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let n = NotificationResponse::parse(payload)?;
                let channel = self.text_encoding.decode_lossy(n.channel).into_owned();
                tracing::trace!(%channel, "notification received");
                self.notifications.push_back(Notification {
                    channel,
                    payload: self.text_encoding.decode_lossy(n.payload).into_owned(),
                    backend_pid: n.pid,
                });
                return Ok(());
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(payload)?;
                let enc = self.text_encoding;
                self.set_param(&enc.decode_lossy(param.name), &enc.decode_lossy(param.value));
                return Ok(());
            }
            _ => {}
        }

        if self.async_status == AsyncStatus::Idle {
            if type_byte == msg_type::ERROR_RESPONSE {
                let text = parse_error_fields(payload, self.text_encoding)?.to_notice_text();
                self.emit_notice(&text);
                self.error_message = text;
            } else {
                tracing::warn!(
                    type_byte = %(type_byte as char),
                    "message arrived from server while idle"
                );
            }
            return Ok(());
        }

        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                self.partial = Some(RawResult {
                    columns: parse_row_description(payload, self.text_encoding)?,
                    ..RawResult::new(ExecStatus::TuplesOk)
                });
            }
            msg_type::DATA_ROW => {
                let row = DataRow::parse(payload)?.to_owned_values()?;
                match &mut self.partial {
                    Some(result) if result.status == ExecStatus::TuplesOk => result.rows.push(row),
                    _ => {
                        return Err(Error::Protocol(
                            "DataRow without preceding RowDescription".into(),
                        ));
                    }
                }
            }
            msg_type::COMMAND_COMPLETE => {
                let tag = CommandComplete::parse(payload)?.tag;
                let mut result = self
                    .partial
                    .take()
                    .unwrap_or_else(|| RawResult::new(ExecStatus::CommandOk));
                result.command_tag = tag.to_string();
                self.ready.push_back(result);
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.ready.push_back(RawResult::new(ExecStatus::EmptyQuery));
            }
            msg_type::ERROR_RESPONSE => {
                let fields = parse_error_fields(payload, self.text_encoding)?;
                self.error_message = fields.to_notice_text();
                self.partial = None;
                self.ready.push_back(RawResult::from_error(fields));
                if matches!(self.async_status, AsyncStatus::CopyIn | AsyncStatus::CopyOut) {
                    self.async_status = AsyncStatus::Busy;
                }
            }
            msg_type::PARSE_COMPLETE => {
                if self.query_kind == QueryKind::Prepare {
                    self.ready.push_back(RawResult::new(ExecStatus::CommandOk));
                }
            }
            msg_type::BIND_COMPLETE
            | msg_type::CLOSE_COMPLETE
            | msg_type::NO_DATA
            | msg_type::PARAMETER_DESCRIPTION
            | msg_type::PORTAL_SUSPENDED
            | msg_type::BACKEND_KEY_DATA => {}
            msg_type::COPY_IN_RESPONSE => {
                let copy = CopyResponse::parse(payload)?;
                tracing::debug!(columns = copy.column_formats.len(), "entering COPY IN");
                self.partial = None;
                self.async_status = AsyncStatus::CopyIn;
                self.ready.push_back(RawResult::new(ExecStatus::CopyIn));
            }
            msg_type::COPY_OUT_RESPONSE => {
                let copy = CopyResponse::parse(payload)?;
                tracing::debug!(columns = copy.column_formats.len(), "entering COPY OUT");
                self.partial = None;
                self.async_status = AsyncStatus::CopyOut;
                self.ready.push_back(RawResult::new(ExecStatus::CopyOut));
            }
            msg_type::COPY_DONE => {
                if self.async_status == AsyncStatus::CopyOut {
                    self.async_status = AsyncStatus::Busy;
                }
            }
            msg_type::COPY_BOTH_RESPONSE => {
                return Err(Error::FeatureNotSupported(
                    "COPY BOTH (replication) is not supported".into(),
                ));
            }
            msg_type::READY_FOR_QUERY => {
                let ready = ReadyForQuery::parse(payload)?;
                self.transaction_status = ready.transaction_status().unwrap_or_default();
                self.async_status = AsyncStatus::Idle;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected message type '{}'",
                    other as char
                )));
            }
        }
        Ok(())
    }

    /// Common entry checks for the `send_*` family.
    fn can_send(&mut self) -> bool {
        if self.status != ConnStatus::Ok {
            self.error_message = "no connection to the server".into();
            return false;
        }
        if self.async_status != AsyncStatus::Idle {
            self.error_message = "another command is already in progress".into();
            return false;
        }
        true
    }

    /// Flush a freshly queued command and mark the connection busy.
    fn dispatch_command(&mut self, kind: QueryKind) -> bool {
        if let Err(e) = self.flush_output() {
            self.fail(format!("could not send data to server: {e}"));
            return false;
        }
        self.error_message.clear();
        self.ready.clear();
        self.partial = None;
        self.query_kind = kind;
        self.async_status = AsyncStatus::Busy;
        true
    }

    /// Append messages to the output buffer, all or nothing.
    fn queue(&mut self, write: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> bool {
        let mark = self.out_buf.len();
        match write(&mut self.out_buf) {
            Ok(()) => true,
            Err(e) => {
                self.out_buf.truncate(mark);
                self.error_message = e.to_string();
                false
            }
        }
    }

    fn queue_bind_execute(buf: &mut Vec<u8>, statement: &str, params: &Params) -> Result<()> {
        let values: Vec<_> = params.iter().collect();
        write_bind(buf, statement, &values)?;
        write_describe_portal(buf)?;
        write_execute(buf)?;
        write_sync(buf)
    }

    fn check_param_count(&mut self, params: &Params) -> bool {
        if u16::try_from(params.len()).is_err() {
            self.error_message = format!(
                "number of parameters must be between 0 and {}",
                u16::MAX
            );
            return false;
        }
        true
    }
}

impl Transport for WireTransport {
    fn status(&self) -> ConnStatus {
        self.status
    }

    fn poll_connect(&mut self) -> PollingStatus {
        match self.phase {
            Phase::Done => {
                return if self.status == ConnStatus::Ok {
                    PollingStatus::Ok
                } else {
                    PollingStatus::Failed
                };
            }
            Phase::Connecting => {
                let connected = match self.stream.as_ref() {
                    Some(stream) => stream.poll_connected(),
                    None => Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "no connection to the server",
                    )),
                };
                match connected {
                    Ok(true) => {
                        self.begin_startup();
                        if self.phase == Phase::Done {
                            return PollingStatus::Failed;
                        }
                    }
                    Ok(false) if self.deadline_passed() => {
                        self.fail("timeout expired".into());
                        return PollingStatus::Failed;
                    }
                    Ok(false) => return PollingStatus::Writing,
                    Err(e) => {
                        self.fail(format!("could not connect to server: {e}"));
                        return PollingStatus::Failed;
                    }
                }
            }
            Phase::Startup => {}
        }

        match self.drive_startup() {
            Ok(status) => status,
            Err(e) => {
                self.fail(describe_error(&e));
                PollingStatus::Failed
            }
        }
    }

    fn protocol_version(&self) -> i32 {
        if self.status == ConnStatus::Ok { 3 } else { 0 }
    }

    fn server_version(&self) -> i32 {
        self.parameter_status("server_version")
            .map(parse_server_version)
            .unwrap_or(0)
    }

    fn backend_pid(&self) -> u32 {
        self.backend_key.map(|(pid, _)| pid).unwrap_or(0)
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }

    fn client_encoding(&self) -> Option<&str> {
        if self.status != ConnStatus::Ok {
            return None;
        }
        self.parameter_status("client_encoding")
    }

    fn db_name(&self) -> &str {
        self.opts.database.as_deref().unwrap_or(&self.opts.user)
    }

    fn user_name(&self) -> &str {
        &self.opts.user
    }

    fn host(&self) -> &str {
        self.opts.socket.as_deref().unwrap_or(&self.opts.host)
    }

    fn port(&self) -> u16 {
        self.opts.port
    }

    fn send_query(&mut self, query: &str) -> bool {
        if !self.can_send() {
            return false;
        }
        self.queue(|buf| write_query(buf, query)) && self.dispatch_command(QueryKind::Simple)
    }

    fn send_query_params(&mut self, query: &str, params: &Params) -> bool {
        if !self.can_send() || !self.check_param_count(params) {
            return false;
        }
        let queued = self.queue(|buf| {
            write_parse(buf, "", query)?;
            Self::queue_bind_execute(buf, "", params)
        });
        queued && self.dispatch_command(QueryKind::Extended)
    }

    fn send_prepare(&mut self, name: &str, query: &str) -> bool {
        if !self.can_send() {
            return false;
        }
        let queued = self.queue(|buf| {
            write_parse(buf, name, query)?;
            write_sync(buf)
        });
        queued && self.dispatch_command(QueryKind::Prepare)
    }

    fn send_query_prepared(&mut self, name: &str, params: &Params) -> bool {
        if !self.can_send() || !self.check_param_count(params) {
            return false;
        }
        self.queue(|buf| Self::queue_bind_execute(buf, name, params))
            && self.dispatch_command(QueryKind::Extended)
    }

    fn get_result(&mut self) -> Option<RawResult> {
        loop {
            if let Some(result) = self.ready.pop_front() {
                return Some(result);
            }
            match self.async_status {
                AsyncStatus::Idle => return None,
                AsyncStatus::CopyIn => return Some(RawResult::new(ExecStatus::CopyIn)),
                AsyncStatus::CopyOut => return Some(RawResult::new(ExecStatus::CopyOut)),
                AsyncStatus::Busy => {}
            }
            if self.status != ConnStatus::Ok {
                return None;
            }

            let before = (self.ready.len(), self.async_status);
            if let Err(e) = self.parse_input() {
                self.fail(describe_error(&e));
                return None;
            }
            if (self.ready.len(), self.async_status) != before {
                continue;
            }

            let io = self.flush_output().and_then(|_| self.read_more());
            if let Err(e) = io {
                self.fail(format!("server closed the connection unexpectedly: {e}"));
                return None;
            }
        }
    }

    fn copy_read_line(&mut self, buf: &mut Vec<u8>) -> isize {
        if self.async_status != AsyncStatus::CopyOut {
            self.error_message = "no COPY in progress".into();
            return -2;
        }
        loop {
            match frame_at(&self.in_buf, self.in_pos) {
                Err(e) => {
                    self.fail(describe_error(&e));
                    return -2;
                }
                Ok(Some((msg_type::COPY_DATA, range))) => {
                    buf.clear();
                    buf.extend_from_slice(&self.in_buf[range.clone()]);
                    self.in_pos = range.end;
                    return buf.len() as isize;
                }
                Ok(Some((msg_type::COPY_DONE, range))) => {
                    self.in_pos = range.end;
                    self.async_status = AsyncStatus::Busy;
                    return -1;
                }
                Ok(Some((
                    type_byte @ (msg_type::NOTICE_RESPONSE
                    | msg_type::NOTIFICATION_RESPONSE
                    | msg_type::PARAMETER_STATUS),
                    range,
                ))) => {
                    if let Err(e) = self.dispatch_frame(type_byte, range) {
                        self.fail(describe_error(&e));
                        return -2;
                    }
                }
                Ok(Some(_)) => {
                    // Anything else ends the copy; get_result picks it up.
                    self.async_status = AsyncStatus::Busy;
                    return -1;
                }
                Ok(None) => {
                    if let Err(e) = self.read_more() {
                        self.fail(format!("could not receive data from server: {e}"));
                        return -2;
                    }
                }
            }
        }
    }

    fn copy_put_data(&mut self, data: &[u8]) -> i32 {
        if self.async_status != AsyncStatus::CopyIn {
            self.error_message = "no COPY in progress".into();
            return -1;
        }
        if !self.queue(|buf| write_copy_data(buf, data)) {
            return -1;
        }
        if self.out_buf.len() >= COPY_FLUSH_THRESHOLD
            && let Err(e) = self.flush_output()
        {
            self.fail(format!("could not send data to server: {e}"));
            return -1;
        }
        1
    }

    fn copy_put_end(&mut self, error: Option<&str>) -> i32 {
        if self.async_status != AsyncStatus::CopyIn {
            self.error_message = "no COPY in progress".into();
            return -1;
        }
        let extended = self.query_kind != QueryKind::Simple;
        let queued = self.queue(|buf| {
            match error {
                Some(message) => write_copy_fail(buf, message)?,
                None => write_copy_done(buf)?,
            }
            if extended {
                write_sync(buf)?;
            }
            Ok(())
        });
        if !queued {
            return -1;
        }
        if let Err(e) = self.flush_output() {
            self.fail(format!("could not send data to server: {e}"));
            return -1;
        }
        self.async_status = AsyncStatus::Busy;
        1
    }

    fn consume_input(&mut self) -> bool {
        if self.status != ConnStatus::Ok {
            self.error_message = "no connection to the server".into();
            return false;
        }
        let outcome = (|| -> io::Result<()> {
            self.stream()?.set_nonblocking(true)?;
            let read = loop {
                match self.read_more() {
                    Ok(_) => {}
                    Err(e) if is_would_block(&e) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            self.stream()?.set_nonblocking(false)?;
            read
        })();
        if let Err(e) = outcome {
            self.fail(format!("could not receive data from server: {e}"));
            return false;
        }
        if let Err(e) = self.parse_input() {
            self.fail(describe_error(&e));
            return false;
        }
        true
    }

    fn is_busy(&mut self) -> bool {
        if self.parse_input().is_err() {
            return false;
        }
        self.async_status == AsyncStatus::Busy && self.ready.is_empty()
    }

    fn next_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    fn socket(&self) -> Option<RawFd> {
        self.stream.as_ref().map(Stream::raw_fd)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        while !self.has_buffered_message() {
            let left = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            self.stream()?.set_read_timeout(Some(left))?;
            let outcome = self.read_more();
            if let Some(stream) = self.stream.as_ref() {
                stream.set_read_timeout(None)?;
            }
            match outcome {
                Ok(_) if Instant::now() >= deadline => return Ok(self.has_buffered_message()),
                Ok(_) => {}
                Err(e) if is_would_block(&e) => return Ok(false),
                Err(e) => {
                    self.fail(format!("could not receive data from server: {e}"));
                    return Err(e);
                }
            }
        }
        Ok(true)
    }

    fn set_notice_processor(&mut self, processor: Option<NoticeProcessor>) {
        self.notice_processor = processor;
    }

    fn cancel_token(&self) -> Option<CancelToken> {
        let (pid, secret) = self.backend_key?;
        let endpoint = self.endpoint.clone()?;
        Some(CancelToken::new(endpoint, pid, secret))
    }

    fn finish(&mut self) {
        if self.stream.is_some() {
            self.out_buf.clear();
            let sent = write_terminate(&mut self.out_buf)
                .map_err(|e| io::Error::other(e.to_string()))
                .and_then(|()| self.flush_output());
            if let Err(e) = sent {
                tracing::debug!(error = %e, "could not send Terminate");
            }
        }
        self.stream = None;
        self.status = ConnStatus::Bad;
        self.phase = Phase::Done;
        self.async_status = AsyncStatus::Idle;
        self.error_message = "connection closed".into();
        tracing::debug!("connection finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::MessageBuilder;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::thread::JoinHandle;

    fn message(type_byte: u8, build: impl FnOnce(&mut MessageBuilder<'_>)) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::new(&mut buf, type_byte);
        build(&mut msg);
        msg.finish().unwrap();
        buf
    }

    #[test]
    fn test_frame_at() {
        let mut buf = message(b'Z', |m| m.write_u8(b'I'));
        assert_eq!(frame_at(&buf, 0).unwrap(), Some((b'Z', 5..6)));
        assert_eq!(frame_at(&buf, 1).unwrap(), None);
        buf.pop();
        assert_eq!(frame_at(&buf, 0).unwrap(), None);
        assert!(frame_at(&[b'Z', 0, 0, 0, 1], 0).is_err());
    }

    #[test]
    fn test_parse_server_version() {
        assert_eq!(parse_server_version("16.2 (Debian 16.2-1.pgdg120+2)"), 160002);
        assert_eq!(parse_server_version("9.6.3"), 90603);
        assert_eq!(parse_server_version("17beta1"), 170000);
        assert_eq!(parse_server_version(""), 0);
    }

    #[test]
    fn test_require_ssl_rejected_up_front() {
        let opts = Opts {
            host: "localhost".into(),
            ssl_mode: SslMode::Require,
            ..Opts::default()
        };
        assert!(matches!(
            WireTransport::connect_start(opts),
            Err(Error::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_refused_connection_is_bad() {
        // Bind then drop a listener to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let opts = Opts {
            host: "127.0.0.1".into(),
            port,
            ssl_mode: SslMode::Disable,
            ..Opts::default()
        };
        let transport = WireTransport::connect(opts).unwrap();
        assert_eq!(transport.status(), ConnStatus::Bad);
        assert!(transport.error_message().contains("could not connect"));
    }

    /// Accept one client, finish its startup with trust auth and the given
    /// `client_encoding`, then hand the socket to `session`.
    fn serve<R: Send + 'static>(
        client_encoding: &'static str,
        session: impl FnOnce(&mut TcpStream) -> R + Send + 'static,
    ) -> (WireTransport, JoinHandle<R>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut len = [0u8; 4];
            socket.read_exact(&mut len).unwrap();
            let mut rest = vec![0u8; i32::from_be_bytes(len) as usize - 4];
            socket.read_exact(&mut rest).unwrap();

            let mut reply = message(b'R', |m| m.write_i32(0));
            reply.extend(message(b'S', |m| {
                m.write_cstr("client_encoding");
                m.write_cstr(client_encoding);
            }));
            reply.extend(message(b'K', |m| {
                m.write_i32(77);
                m.write_i32(1);
            }));
            reply.extend(message(b'Z', |m| m.write_u8(b'I')));
            socket.write_all(&reply).unwrap();
            session(&mut socket)
        });

        let opts = Opts {
            host: "127.0.0.1".into(),
            port,
            user: "tester".into(),
            ..Opts::default()
        };
        let transport = WireTransport::connect(opts).unwrap();
        assert_eq!(transport.status(), ConnStatus::Ok, "{}", transport.error_message());
        (transport, server)
    }

    fn read_terminate(socket: &mut TcpStream) -> u8 {
        let mut terminate = [0u8; 5];
        socket.read_exact(&mut terminate).unwrap();
        terminate[0]
    }

    fn next_notification(transport: &mut WireTransport) -> Option<Notification> {
        for _ in 0..50 {
            assert!(transport.consume_input(), "{}", transport.error_message());
            if let Some(n) = transport.next_notification() {
                return Some(n);
            }
            transport.wait_readable(Duration::from_millis(100)).unwrap();
        }
        None
    }

    #[test]
    fn test_single_byte_encoding_notification() {
        let (mut transport, server) = serve("LATIN1", |socket| {
            let notify = message(b'A', |m| {
                m.write_i32(77);
                m.write_cstr("chan");
                m.write_bytes(b"caf\xe9\0");
            });
            socket.write_all(&notify).unwrap();
            read_terminate(socket)
        });

        let n = next_notification(&mut transport).unwrap();
        assert_eq!(n.channel, "chan");
        assert_eq!(n.payload, "caf\u{e9}");
        assert_eq!(n.backend_pid, 77);
        assert_eq!(transport.status(), ConnStatus::Ok);

        transport.finish();
        assert_eq!(server.join().unwrap(), b'X');
    }

    #[test]
    fn test_wait_readable_ignores_partial_message() {
        let (release, released) = std::sync::mpsc::channel::<()>();
        let (mut transport, server) = serve("UTF8", move |socket| {
            let notify = message(b'A', |m| {
                m.write_i32(77);
                m.write_cstr("chan");
                m.write_cstr("late");
            });
            socket.write_all(&notify[..3]).unwrap();
            released.recv().unwrap();
            socket.write_all(&notify[3..]).unwrap();
            read_terminate(socket)
        });

        let started = Instant::now();
        assert!(!transport.wait_readable(Duration::from_millis(150)).unwrap());
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(transport.status(), ConnStatus::Ok);

        release.send(()).unwrap();
        assert!(transport.wait_readable(Duration::from_secs(5)).unwrap());
        let n = next_notification(&mut transport).unwrap();
        assert_eq!(n.payload, "late");

        transport.finish();
        assert_eq!(server.join().unwrap(), b'X');
    }

    #[test]
    fn test_startup_over_socket_pair() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut len = [0u8; 4];
            socket.read_exact(&mut len).unwrap();
            let mut rest = vec![0u8; i32::from_be_bytes(len) as usize - 4];
            socket.read_exact(&mut rest).unwrap();

            let mut reply = message(b'R', |m| m.write_i32(0));
            reply.extend(message(b'S', |m| {
                m.write_cstr("server_version");
                m.write_cstr("15.4");
            }));
            reply.extend(message(b'S', |m| {
                m.write_cstr("client_encoding");
                m.write_cstr("UTF8");
            }));
            reply.extend(message(b'K', |m| {
                m.write_i32(321);
                m.write_i32(654);
            }));
            reply.extend(message(b'Z', |m| m.write_u8(b'I')));
            socket.write_all(&reply).unwrap();

            // Terminate
            let mut terminate = [0u8; 5];
            socket.read_exact(&mut terminate).unwrap();
            terminate[0]
        });

        let opts = Opts {
            host: "127.0.0.1".into(),
            port,
            user: "tester".into(),
            ..Opts::default()
        };
        let mut transport = WireTransport::connect(opts).unwrap();
        assert_eq!(transport.status(), ConnStatus::Ok, "{}", transport.error_message());
        assert_eq!(transport.protocol_version(), 3);
        assert_eq!(transport.server_version(), 150004);
        assert_eq!(transport.backend_pid(), 321);
        assert_eq!(transport.client_encoding(), Some("UTF8"));
        assert_eq!(transport.db_name(), "tester");
        assert!(transport.cancel_token().is_some());

        transport.finish();
        assert_eq!(server.join().unwrap(), b'X');
        assert_eq!(transport.status(), ConnStatus::Bad);
    }
}
