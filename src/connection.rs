//! The session: one connection to a server and everything hanging off it.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::copy::{CopyIn, CopyOut};
use crate::encoding::escape;
use crate::encoding::{EncodingGroup, enc_group};
use crate::error::{Error, ErrorFields, Result, check_cast};
use crate::guest::{Guest, GuestSlot};
use crate::notice::{NoticeHandler, NoticeHub, NoticeObserver};
use crate::notification::{Listeners, NotificationHandler, NotificationReceiver};
use crate::opts::Opts;
use crate::result::QueryResult;
use crate::transaction::Transaction;
use crate::transport::{
    CancelToken, ConnStatus, ExecStatus, Params, PollingStatus, RawResult, Transport,
    WireTransport,
};

/// Oldest server version accepted, exclusive (`major * 10000 + minor * 100`).
const MIN_SERVER_VERSION: i32 = 90000;

const LOST_CONNECTION: &str = "Lost connection to the database server.";

/// Query label used for the result that ends a COPY.
const END_COPY: &str = "[END COPY]";

/// Default wait of [`Connection::await_notification`].
pub const DEFAULT_NOTIFICATION_WAIT: Duration = Duration::from_secs(10);

/// A session with a PostgreSQL server.
///
/// The connection owns its transport exclusively. Commands run one at a time
/// and block until the server answers. Asynchronous notifications are
/// delivered to listeners after each command and by the explicit
/// [`get_notifs`](Self::get_notifs) / [`await_notification`](Self::await_notification)
/// calls.
///
/// ```no_run
/// use pg_session::Connection;
///
/// let mut conn = Connection::new("postgres://postgres@localhost/postgres")?;
/// let result = conn.exec("SELECT 1")?;
/// assert_eq!(result.one_field()?, Some("1"));
/// # Ok::<(), pg_session::Error>(())
/// ```
pub struct Connection<T: Transport = WireTransport> {
    transport: Option<T>,
    notices: NoticeHub,
    trans: GuestSlot,
    focus: GuestSlot,
    listeners: Listeners,
    unique_id: u64,
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .field("backend_pid", &self.backend_pid())
            .field("transaction", &self.trans.current().map(Guest::describe))
            .finish_non_exhaustive()
    }
}

impl Connection<WireTransport> {
    /// Connect to a server, blocking until the session is ready.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        tracing::debug!(host = %opts.host, port = opts.port, "connecting");
        Self::from_transport(WireTransport::connect(opts)?)
    }
}

impl<T: Transport> Connection<T> {
    fn with_transport(mut transport: T) -> Self {
        let notices = NoticeHub::new();
        let hub = notices.clone();
        transport.set_notice_processor(Some(Box::new(move |text: &str| hub.process_notice(text))));
        Self {
            transport: Some(transport),
            notices,
            trans: GuestSlot::new(),
            focus: GuestSlot::new(),
            listeners: Listeners::default(),
            unique_id: 0,
        }
    }

    /// Wrap a transport whose connection attempt has finished.
    ///
    /// Fails with [`Error::BrokenConnection`] if the attempt failed and with
    /// [`Error::FeatureNotSupported`] if the server is too old; the transport
    /// is finished in both cases.
    pub fn from_transport(transport: T) -> Result<Self> {
        let mut conn = Self::with_transport(transport);
        conn.complete_init()?;
        Ok(conn)
    }

    /// Wrap a transport whose non-blocking connection attempt has started.
    pub(crate) fn from_started(transport: T) -> Result<Self> {
        let conn = Self::with_transport(transport);
        if conn.transport.as_ref().map(Transport::status) == Some(ConnStatus::Bad) {
            return Err(Error::BrokenConnection(conn.err_msg().to_string()));
        }
        Ok(conn)
    }

    /// Advance a non-blocking connection attempt. Returns whether to wait
    /// for the socket to become readable and writable, respectively;
    /// `(false, false)` means done.
    pub(crate) fn poll_connect(&mut self) -> Result<(bool, bool)> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::BrokenConnection("No connection.".into()))?;
        match transport.poll_connect() {
            PollingStatus::Failed => Err(Error::BrokenConnection(
                transport.error_message().to_string(),
            )),
            PollingStatus::Reading => Ok((true, false)),
            PollingStatus::Writing => Ok((false, true)),
            PollingStatus::Ok => {
                if !self.is_open() {
                    return Err(Error::BrokenConnection(self.err_msg().to_string()));
                }
                Ok((false, false))
            }
            PollingStatus::Active => Err(Error::Internal(
                "Nonblocking connection poll returned obsolete 'active' state.".into(),
            )),
        }
    }

    /// Check an established session. On failure the transport is finished
    /// and released.
    pub(crate) fn complete_init(&mut self) -> Result<()> {
        let outcome = if self.is_open() {
            self.set_up_state()
        } else {
            Err(Error::BrokenConnection(self.err_msg().to_string()))
        };
        if outcome.is_err()
            && let Some(mut transport) = self.transport.take()
        {
            transport.finish();
        }
        outcome
    }

    fn set_up_state(&mut self) -> Result<()> {
        let transport = self.transport()?;
        let proto = transport.protocol_version();
        if proto == 0 {
            return Err(Error::BrokenConnection("No connection.".into()));
        }
        if proto < 3 {
            return Err(Error::FeatureNotSupported(
                "Unsupported frontend/backend protocol version; 3.0 is the minimum.".into(),
            ));
        }
        if transport.server_version() <= MIN_SERVER_VERSION {
            return Err(Error::FeatureNotSupported(
                "Unsupported server version; 9.0 is the minimum.".into(),
            ));
        }
        tracing::debug!(
            pid = transport.backend_pid(),
            server_version = transport.server_version(),
            "session ready"
        );
        Ok(())
    }

    fn transport(&self) -> Result<&T> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::BrokenConnection("Connection is closed.".into()))
    }

    fn transport_mut(&mut self) -> Result<&mut T> {
        self.transport
            .as_mut()
            .ok_or_else(|| Error::BrokenConnection("Connection is closed.".into()))
    }

    /// Whether the session is established and usable.
    pub fn is_open(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|t| t.status() == ConnStatus::Ok)
    }

    /// Close the session.
    ///
    /// Closing a closed connection does nothing. An open transaction or
    /// registered receivers are reported as notices, never as errors.
    pub fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if let Some(trans) = self.trans.current() {
            self.notices.process_notice(&format!(
                "Closing connection while {} is still open.\n",
                trans.describe()
            ));
        }
        if self.listeners.has_receivers() {
            self.notices
                .process_notice("Closing connection with outstanding receivers.\n");
            self.listeners.clear_receivers();
        }
        let detached = self.notices.clear_observers();
        transport.set_notice_processor(None);
        transport.finish();
        tracing::debug!(detached, "connection closed");
    }

    /// Move the session out, leaving `self` closed.
    ///
    /// Refused while a transaction or receivers are registered.
    pub fn take(&mut self) -> Result<Self> {
        self.check_movable()?;
        Ok(Self {
            transport: self.transport.take(),
            notices: std::mem::take(&mut self.notices),
            trans: GuestSlot::new(),
            focus: GuestSlot::new(),
            listeners: std::mem::take(&mut self.listeners),
            unique_id: self.unique_id,
        })
    }

    /// Replace this session with `other`, closing the current one first.
    ///
    /// Refused while a transaction or receivers are registered on either side.
    pub fn assign(&mut self, mut other: Self) -> Result<()> {
        self.check_overwritable()?;
        other.check_movable()?;
        self.close();
        self.transport = other.transport.take();
        self.notices = std::mem::take(&mut other.notices);
        self.listeners = std::mem::take(&mut other.listeners);
        self.unique_id = other.unique_id;
        Ok(())
    }

    fn check_movable(&self) -> Result<()> {
        if self.trans.is_occupied() {
            return Err(Error::Usage(
                "Moving a connection with a transaction open.".into(),
            ));
        }
        if self.listeners.has_receivers() {
            return Err(Error::Usage(
                "Moving a connection with notification receivers registered.".into(),
            ));
        }
        Ok(())
    }

    fn check_overwritable(&self) -> Result<()> {
        if self.trans.is_occupied() {
            return Err(Error::Usage(
                "Moving a connection onto one with a transaction open.".into(),
            ));
        }
        if self.listeners.has_receivers() {
            return Err(Error::Usage(
                "Moving a connection onto one with notification receivers registered.".into(),
            ));
        }
        Ok(())
    }

    // === Commands ===

    /// Drain the results of the command just sent. Keeps the first error,
    /// otherwise the last result; stops at a COPY result.
    fn collect_result(&mut self) -> Option<RawResult> {
        let transport = self.transport.as_mut()?;
        let mut kept: Option<RawResult> = None;
        while let Some(result) = transport.get_result() {
            let copy = result.status.is_copy();
            if kept
                .as_ref()
                .is_none_or(|k| k.status != ExecStatus::FatalError)
            {
                kept = Some(result);
            }
            if copy {
                break;
            }
        }
        kept
    }

    /// Turn a raw response into a validated result.
    fn make_result(&self, raw: Option<RawResult>, query: &str) -> Result<QueryResult> {
        let Some(raw) = raw else {
            return Err(if self.is_open() {
                Error::Failure(self.err_msg().to_string())
            } else {
                Error::BrokenConnection(LOST_CONNECTION.into())
            });
        };
        let result = QueryResult::new(raw, query, self.notices.clone(), self.encoding_group()?);
        result.check_status()?;
        Ok(result)
    }

    fn check_focus(&self) -> Result<()> {
        match self.focus.current() {
            Some(focus) => Err(Error::Usage(format!(
                "Started new query while {} is still active.",
                focus.describe()
            ))),
            None => Ok(()),
        }
    }

    fn send_failure(&self) -> Error {
        if self.is_open() {
            Error::Failure(self.err_msg().to_string())
        } else {
            Error::BrokenConnection(self.err_msg().to_string())
        }
    }

    /// Run a command and wait for its result.
    ///
    /// Pending notifications are dispatched before returning.
    pub fn exec(&mut self, query: &str) -> Result<QueryResult> {
        self.check_focus()?;
        tracing::trace!(query, "exec");
        if !self.transport_mut()?.send_query(query) {
            return Err(self.send_failure());
        }
        let raw = self.collect_result();
        let result = self.make_result(raw, query)?;
        self.get_notifs()?;
        Ok(result)
    }

    /// Run a parameterized command.
    pub fn exec_params(&mut self, query: &str, params: &Params) -> Result<QueryResult> {
        self.check_focus()?;
        check_cast::<u16, _>(params.len(), "Too many parameters")?;
        if !self.transport_mut()?.send_query_params(query, params) {
            return Err(self.send_failure());
        }
        let raw = self.collect_result();
        let result = self.make_result(raw, query)?;
        self.get_notifs()?;
        Ok(result)
    }

    /// Create a prepared statement.
    pub fn prepare(&mut self, name: &str, definition: &str) -> Result<()> {
        self.check_focus()?;
        if !self.transport_mut()?.send_prepare(name, definition) {
            return Err(self.send_failure());
        }
        let raw = self.collect_result();
        self.make_result(raw, &format!("[PREPARE {name}]"))?;
        tracing::debug!(name, "statement prepared");
        Ok(())
    }

    /// Drop a prepared statement.
    pub fn unprepare(&mut self, name: &str) -> Result<()> {
        let query = format!("DEALLOCATE {}", self.quote_name(name)?);
        self.exec(&query)?;
        Ok(())
    }

    /// Execute a prepared statement.
    pub fn exec_prepared(&mut self, name: &str, params: &Params) -> Result<QueryResult> {
        self.check_focus()?;
        check_cast::<u16, _>(params.len(), "Too many parameters")?;
        if !self.transport_mut()?.send_query_prepared(name, params) {
            return Err(self.send_failure());
        }
        let raw = self.collect_result();
        let result = self.make_result(raw, name)?;
        self.get_notifs()?;
        Ok(result)
    }

    // === Transactions and other guests ===

    /// Start a transaction on this connection.
    pub fn transaction(&mut self) -> Result<Transaction<'_, T>> {
        Transaction::new(self)
    }

    /// Run `f` inside a transaction.
    ///
    /// The transaction is committed if `f` returns `Ok` and rolled back
    /// otherwise.
    pub fn run_transaction<F, R>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_, T>) -> Result<R>,
    {
        let mut tx = Transaction::new(self)?;
        let value = f(&mut tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Occupy the transaction slot.
    ///
    /// Fails with [`Error::Usage`] if another transaction is registered.
    pub fn register_transaction(&mut self, guest: &Guest) -> Result<()> {
        self.trans.register(guest)
    }

    /// Vacate the transaction slot. A mismatch is reported as a notice; the
    /// slot is emptied either way.
    pub fn unregister_transaction(&mut self, guest: &Guest) {
        if let Err(e) = self.trans.unregister(guest) {
            self.process_notice(&format!("{e}\n"));
        }
        self.trans.clear();
    }

    /// The registered transaction, if any.
    pub fn current_transaction(&self) -> Option<&Guest> {
        self.trans.current()
    }

    pub(crate) fn register_focus(&mut self, guest: &Guest) -> Result<()> {
        self.focus.register(guest)
    }

    pub(crate) fn unregister_focus(&mut self, guest: &Guest) {
        if let Err(e) = self.focus.unregister(guest) {
            self.process_notice(&format!("{e}\n"));
        }
    }

    pub(crate) fn current_focus(&self) -> Option<&Guest> {
        self.focus.current()
    }

    // === COPY ===

    /// Start `COPY ... TO STDOUT` and stream its lines.
    pub fn copy_out(&mut self, query: &str) -> Result<CopyOut<'_, T>> {
        CopyOut::start(self, query)
    }

    /// Start `COPY ... FROM STDIN` and stream lines to it.
    pub fn copy_in(&mut self, query: &str) -> Result<CopyIn<'_, T>> {
        CopyIn::start(self, query)
    }

    /// Read one line of COPY data, without its terminator. `None` marks the
    /// end of the data, after the command's final result has been checked.
    pub fn read_copy_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let code = self.transport_mut()?.copy_read_line(&mut line);
        match code {
            -2 => Err(Error::Failure(format!(
                "Reading of table data failed: {}",
                self.err_msg()
            ))),
            -1 => {
                self.finish_copy()?;
                tracing::debug!("COPY OUT finished");
                Ok(None)
            }
            0 => Err(Error::Internal(
                "table read inexplicably went asynchronous".into(),
            )),
            n if n > 0 => {
                line.truncate(line.len().saturating_sub(1));
                Ok(Some(line))
            }
            n => Err(Error::Internal(format!(
                "unexpected result {n} from copy read"
            ))),
        }
    }

    /// Send one line of COPY data; the terminator is added.
    pub fn write_copy_line(&mut self, line: &[u8]) -> Result<()> {
        check_cast::<i32, _>(line.len(), "Line in copy stream is too long to process.")?;
        let transport = self.transport_mut()?;
        if transport.copy_put_data(line) <= 0 || transport.copy_put_data(b"\n") <= 0 {
            return Err(Error::Failure(format!(
                "Error writing to table: {}",
                self.err_msg()
            )));
        }
        Ok(())
    }

    /// Signal the end of COPY data and check the command's result.
    pub fn end_copy_write(&mut self) -> Result<QueryResult> {
        let code = self.transport_mut()?.copy_put_end(None);
        match code {
            -1 => Err(Error::Failure(format!(
                "Write to table failed: {}",
                self.err_msg()
            ))),
            0 => Err(Error::Internal(
                "table write is inexplicably asynchronous".into(),
            )),
            1 => {
                let result = self.finish_copy()?;
                tracing::debug!(rows = result.affected_rows(), "COPY IN finished");
                Ok(result)
            }
            n => Err(Error::Internal(format!(
                "unexpected result {n} from copy end"
            ))),
        }
    }

    /// Abandon COPY IN. The server rolls the command back with `reason`.
    ///
    /// The error the server answers CopyFail with is expected and swallowed;
    /// a write failure or a lost connection is returned.
    pub(crate) fn abort_copy_write(&mut self, reason: &str) -> Result<()> {
        match self.transport_mut()?.copy_put_end(Some(reason)) {
            1 => {}
            -1 => return Err(self.send_failure()),
            n => {
                return Err(Error::Internal(format!(
                    "unexpected result {n} from copy end"
                )));
            }
        }
        let raw = self.collect_result();
        self.drain_results();
        match self.make_result(raw, END_COPY) {
            Err(e) if e.is_connection_broken() => Err(e),
            _ => Ok(()),
        }
    }

    fn finish_copy(&mut self) -> Result<QueryResult> {
        let raw = self.transport.as_mut().and_then(Transport::get_result);
        let result = self.make_result(raw, END_COPY);
        self.drain_results();
        result
    }

    fn drain_results(&mut self) {
        if let Some(transport) = self.transport.as_mut() {
            while transport.get_result().is_some() {}
        }
    }

    // === Notices ===

    /// The hub this session delivers notices to.
    pub fn notice_hub(&self) -> &NoticeHub {
        &self.notices
    }

    /// Deliver a notice as if the server had sent it.
    pub fn process_notice(&self, message: &str) {
        self.notices.process_notice(message);
    }

    pub fn add_notice_observer(&self, observer: Arc<dyn NoticeObserver>) {
        self.notices.add_observer(observer);
    }

    pub fn remove_notice_observer(&self, observer: &Arc<dyn NoticeObserver>) -> bool {
        self.notices.remove_observer(observer)
    }

    pub fn set_notice_handler(&self, handler: Option<NoticeHandler>) {
        self.notices.set_notice_handler(handler);
    }

    // === Notifications ===

    /// Watch `channel` with `handler`, or stop watching it with `None`.
    ///
    /// `LISTEN` is issued only when the channel was not watched before;
    /// replacing a handler sends nothing. Fails with [`Error::Usage`] while
    /// a transaction is registered.
    pub fn listen(&mut self, channel: &str, handler: Option<NotificationHandler>) -> Result<()> {
        if self.trans.is_occupied() {
            return Err(Error::Usage(format!(
                "Attempting to listen for notifications on '{channel}' while transaction is active."
            )));
        }
        match handler {
            Some(handler) => {
                if !self.listeners.is_watched(channel) {
                    let query = format!("LISTEN {}", self.quote_name(channel)?);
                    self.exec(&query)?.no_rows()?;
                }
                self.listeners.set_handler(channel, handler);
            }
            None => {
                if self.listeners.has_handler(channel) {
                    if !self.listeners.has_receivers_on(channel) {
                        let query = format!("UNLISTEN {}", self.quote_name(channel)?);
                        self.exec(&query)?.no_rows()?;
                    }
                    self.listeners.remove_handler(channel);
                }
            }
        }
        Ok(())
    }

    /// Register a receiver, issuing `LISTEN` if its channel is new.
    pub fn add_receiver(&mut self, receiver: Arc<dyn NotificationReceiver>) -> Result<()> {
        let channel = receiver.channel().to_string();
        if !self.listeners.is_watched(&channel) {
            let query = format!("LISTEN {}", self.quote_name(&channel)?);
            self.exec(&query)?.no_rows()?;
        }
        self.listeners.add_receiver(receiver);
        Ok(())
    }

    /// Unregister a receiver, issuing `UNLISTEN` when its channel is no
    /// longer watched. Problems are reported as notices.
    pub fn remove_receiver(&mut self, receiver: &Arc<dyn NotificationReceiver>) {
        let channel = receiver.channel().to_string();
        match self.listeners.remove_receiver(receiver) {
            None => self.process_notice(&format!(
                "Attempt to remove unknown receiver '{channel}'\n"
            )),
            Some(true) if !self.listeners.is_watched(&channel) => {
                let outcome = self
                    .quote_name(&channel)
                    .and_then(|name| self.exec(&format!("UNLISTEN {name}")));
                if let Err(e) = outcome {
                    self.process_notice(&format!("{e}\n"));
                }
            }
            Some(_) => {}
        }
    }

    /// Dispatch every notification received so far. Returns how many.
    ///
    /// While a transaction is registered nothing is dispatched; the
    /// notifications stay queued until the next call without one.
    pub fn get_notifs(&mut self) -> Result<usize> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| Error::BrokenConnection("Connection lost.".into()))?;
        if !transport.consume_input() {
            return Err(Error::BrokenConnection("Connection lost.".into()));
        }
        if self.trans.is_occupied() {
            return Ok(0);
        }

        let mut count = 0;
        while let Some(notification) = self
            .transport
            .as_mut()
            .and_then(Transport::next_notification)
        {
            self.listeners.dispatch(&notification, &self.notices);
            count += 1;
        }
        Ok(count)
    }

    /// Like [`await_notification_timeout`](Self::await_notification_timeout)
    /// with [`DEFAULT_NOTIFICATION_WAIT`].
    pub fn await_notification(&mut self) -> Result<usize> {
        self.await_notification_timeout(DEFAULT_NOTIFICATION_WAIT)
    }

    /// Dispatch pending notifications; if there were none, wait up to
    /// `timeout` for the socket to become readable and try once more.
    /// Returns 0 if the wait expired.
    pub fn await_notification_timeout(&mut self, timeout: Duration) -> Result<usize> {
        let count = self.get_notifs()?;
        if count > 0 {
            return Ok(count);
        }
        self.transport_mut()?.wait_readable(timeout)?;
        self.get_notifs()
    }

    // === Session information ===

    /// Backend process ID, 0 if closed.
    pub fn backend_pid(&self) -> u32 {
        self.transport.as_ref().map_or(0, Transport::backend_pid)
    }

    /// Socket descriptor, for readiness polling.
    pub fn sock(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(Transport::socket)
    }

    pub fn protocol_version(&self) -> i32 {
        self.transport.as_ref().map_or(0, Transport::protocol_version)
    }

    pub fn server_version(&self) -> i32 {
        self.transport.as_ref().map_or(0, Transport::server_version)
    }

    pub fn dbname(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::db_name)
    }

    pub fn username(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::user_name)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.transport.as_ref().map(Transport::host)
    }

    pub fn port(&self) -> Option<u16> {
        self.transport.as_ref().map(Transport::port)
    }

    /// Most recent error text from the transport.
    pub fn err_msg(&self) -> &str {
        self.transport
            .as_ref()
            .map_or("No connection to database", Transport::error_message)
    }

    /// Generate a session-unique name: `x<N>`, or `<base>_<N>`.
    pub fn adorn_name(&mut self, base: &str) -> String {
        self.unique_id += 1;
        if base.is_empty() {
            format!("x{}", self.unique_id)
        } else {
            format!("{base}_{}", self.unique_id)
        }
    }

    /// `SET name=value`. `value` is inserted as given.
    pub fn set_variable(&mut self, name: &str, value: &str) -> Result<()> {
        let query = format!("SET {}={value}", self.quote_name(name)?);
        self.exec(&query)?;
        Ok(())
    }

    /// `SHOW name`.
    pub fn get_variable(&mut self, name: &str) -> Result<String> {
        let query = format!("SHOW {}", self.quote_name(name)?);
        let result = self.exec(&query)?;
        let value = result
            .one_field()?
            .ok_or_else(|| Error::Conversion(format!("Variable '{name}' is null.")))?;
        Ok(value.to_string())
    }

    fn client_encoding_name(&self) -> Result<&str> {
        match self.transport.as_ref().and_then(Transport::client_encoding) {
            Some(name) => Ok(name),
            None if self.is_open() => {
                Err(Error::Failure("Could not obtain client encoding.".into()))
            }
            None => Err(Error::BrokenConnection(LOST_CONNECTION.into())),
        }
    }

    /// Name of the client encoding in effect.
    pub fn get_client_encoding(&self) -> Result<String> {
        self.client_encoding_name().map(str::to_string)
    }

    /// Switch the client encoding.
    pub fn set_client_encoding(&mut self, encoding: &str) -> Result<()> {
        let query = format!("SET client_encoding TO {}", self.quote(encoding)?);
        match self.exec(&query) {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::debug!(encoding, error = %e, "client encoding not changed");
                Err(if self.is_open() {
                    Error::Failure("Setting client encoding failed.".into())
                } else {
                    Error::BrokenConnection(LOST_CONNECTION.into())
                })
            }
        }
    }

    /// Glyph-scanning group of the client encoding.
    pub fn encoding_group(&self) -> Result<EncodingGroup> {
        enc_group(self.client_encoding_name()?)
    }

    // === Escaping ===

    /// Escape text for use inside a single-quoted literal.
    pub fn esc(&self, text: &str) -> Result<String> {
        escape::esc(self.encoding_group()?, text)
    }

    /// Quote text as a string literal.
    pub fn quote(&self, text: &str) -> Result<String> {
        escape::quote(self.encoding_group()?, text)
    }

    /// Quote binary data as a `bytea` literal.
    pub fn quote_raw(&self, data: &[u8]) -> String {
        escape::quote_raw(data)
    }

    /// Quote an identifier.
    pub fn quote_name(&self, identifier: &str) -> Result<String> {
        escape::quote_name(self.encoding_group()?, identifier)
    }

    /// Quote a dotted table path such as `["public", "users"]`.
    pub fn quote_table<S: AsRef<str>>(&self, path: &[S]) -> Result<String> {
        escape::quote_table(self.encoding_group()?, path)
    }

    /// Escape the wildcards of a LIKE pattern.
    pub fn esc_like(&self, text: &str, escape_char: char) -> Result<String> {
        escape::esc_like(self.encoding_group()?, text, escape_char)
    }

    /// Hex-escape binary data (`\x...`).
    pub fn esc_raw(&self, data: &[u8]) -> String {
        escape::esc_bin(data)
    }

    /// Decode hex-escaped binary data.
    pub fn unesc_raw(&self, text: &str) -> Result<Vec<u8>> {
        escape::unesc_bin(text.as_bytes())
    }

    // === Cancellation ===

    /// A handle that can cancel this session's running command from
    /// another thread.
    pub fn cancel_handle(&self) -> Result<CancelToken> {
        self.transport()?
            .cancel_token()
            .ok_or_else(|| Error::BrokenConnection("Cannot cancel query: no connection.".into()))
    }

    /// Ask the server to cancel the command in progress.
    pub fn cancel_query(&self) -> Result<()> {
        let token = self.cancel_handle()?;
        token.cancel().map_err(|e| Error::Sql {
            fields: ErrorFields {
                message: Some(e.to_string()),
                ..ErrorFields::default()
            },
            query: "[cancel]".into(),
        })
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{BoxError, Notification};
    use crate::transport::mock::{CopyRead, MockTransport};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn open() -> (Connection<MockTransport>, MockTransport) {
        let mock = MockTransport::new();
        let conn = Connection::from_transport(mock.clone()).unwrap();
        (conn, mock)
    }

    fn collect_notices(conn: &Connection<MockTransport>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.set_notice_handler(Some(Arc::new(move |m: &str| {
            sink.lock().unwrap().push(m.to_string());
        })));
        seen
    }

    fn counting_handler(count: &Arc<AtomicUsize>) -> NotificationHandler {
        let count = Arc::clone(count);
        Box::new(move |_: &Notification| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_version_gate() {
        let mock = MockTransport::new();
        mock.script().server_version = 80400;
        assert!(matches!(
            Connection::from_transport(mock.clone()),
            Err(Error::FeatureNotSupported(_))
        ));
        assert_eq!(mock.script().finished, 1);

        let mock = MockTransport::new();
        mock.script().protocol_version = 2;
        assert!(matches!(
            Connection::from_transport(mock),
            Err(Error::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn test_failed_connect_is_broken() {
        let mock = MockTransport::new();
        {
            let mut script = mock.script();
            script.status = ConnStatus::Bad;
            script.error_message = "could not connect to server".into();
        }
        let err = Connection::from_transport(mock.clone()).unwrap_err();
        assert!(matches!(err, Error::BrokenConnection(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut conn, mock) = open();
        assert!(conn.is_open());
        conn.close();
        conn.close();
        assert!(!conn.is_open());
        assert_eq!(mock.script().finished, 1);
        assert!(!mock.script().has_notice_processor());
        drop(conn);
        assert_eq!(mock.script().finished, 1);
    }

    #[test]
    fn test_server_notices_reach_hub() {
        let (conn, mock) = open();
        let seen = collect_notices(&conn);
        mock.script().emit_notice("WARNING:  careful\n");
        assert_eq!(*seen.lock().unwrap(), vec!["WARNING:  careful\n"]);
    }

    #[test]
    fn test_exec_error_and_refused_send() {
        let (mut conn, mock) = open();
        mock.script().respond(vec![RawResult::from_error(ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42601".into()),
            message: Some("syntax error".into()),
            ..ErrorFields::default()
        })]);
        assert!(matches!(conn.exec("SELEC 1"), Err(Error::Sql { .. })));

        {
            let mut script = mock.script();
            script.refuse_send = true;
            script.error_message = "another command is already in progress".into();
        }
        match conn.exec("SELECT 1") {
            Err(Error::Failure(msg)) => assert_eq!(msg, "another command is already in progress"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_missing_result_is_classified() {
        let (mut conn, mock) = open();
        mock.script().respond(Vec::new());
        mock.script().error_message = "server said no".into();
        assert!(matches!(conn.exec("SELECT 1"), Err(Error::Failure(m)) if m == "server said no"));

        mock.script().lose_connection_on_send = true;
        match conn.exec("SELECT 1") {
            Err(Error::BrokenConnection(msg)) => assert_eq!(msg, LOST_CONNECTION),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_first_error_wins() {
        let (mut conn, mock) = open();
        let error = RawResult::from_error(ErrorFields {
            code: Some("22012".into()),
            message: Some("division by zero".into()),
            ..ErrorFields::default()
        });
        mock.script().respond(vec![
            RawResult::command("SELECT 1"),
            error,
            RawResult::command("SELECT 1"),
        ]);
        let err = conn.exec("SELECT 1; SELECT 1/0; SELECT 1").unwrap_err();
        assert_eq!(err.sqlstate(), Some("22012"));
    }

    #[test]
    fn test_listen_then_unlisten_sends_each_once() {
        let (mut conn, mock) = open();
        let count = Arc::new(AtomicUsize::new(0));
        conn.listen("updates", Some(counting_handler(&count))).unwrap();
        conn.listen("updates", Some(counting_handler(&count))).unwrap();
        conn.listen("updates", None).unwrap();
        conn.listen("updates", None).unwrap();
        assert_eq!(
            mock.script().sent,
            vec!["LISTEN \"updates\"", "UNLISTEN \"updates\""]
        );
    }

    #[test]
    fn test_listen_refused_during_transaction() {
        let (mut conn, _mock) = open();
        let guest = Guest::new("transaction", "");
        conn.register_transaction(&guest).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            conn.listen("updates", Some(counting_handler(&count))),
            Err(Error::Usage(_))
        ));
        conn.unregister_transaction(&guest);
    }

    struct Recorder {
        channel: &'static str,
        fail: bool,
        payloads: Mutex<Vec<String>>,
    }

    impl NotificationReceiver for Recorder {
        fn channel(&self) -> &str {
            self.channel
        }

        fn receive(&self, payload: &str, _backend_pid: u32) -> std::result::Result<(), BoxError> {
            self.payloads.lock().unwrap().push(payload.to_string());
            if self.fail {
                return Err("receiver failed".into());
            }
            Ok(())
        }
    }

    fn recorder(channel: &'static str, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            channel,
            fail,
            payloads: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_notification_reaches_every_receiver() {
        let (mut conn, mock) = open();
        let seen = collect_notices(&conn);
        let bad = recorder("updates", true);
        let good = recorder("updates", false);
        conn.add_receiver(bad.clone()).unwrap();
        conn.add_receiver(good.clone()).unwrap();
        assert_eq!(mock.script().sent, vec!["LISTEN \"updates\""]);

        mock.script().notify("updates", "42", 99);
        assert_eq!(conn.get_notifs().unwrap(), 1);
        assert_eq!(*bad.payloads.lock().unwrap(), vec!["42"]);
        assert_eq!(*good.payloads.lock().unwrap(), vec!["42"]);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let bad_dyn: Arc<dyn NotificationReceiver> = bad;
        conn.remove_receiver(&bad_dyn);
        assert_eq!(mock.script().sent.len(), 1);
        let good_dyn: Arc<dyn NotificationReceiver> = good;
        conn.remove_receiver(&good_dyn);
        assert_eq!(mock.script().sent[1], "UNLISTEN \"updates\"");

        conn.remove_receiver(&good_dyn);
        assert_eq!(
            seen.lock().unwrap().last().unwrap(),
            "Attempt to remove unknown receiver 'updates'\n"
        );
    }

    #[test]
    fn test_notifications_wait_for_transaction_end() {
        let (mut conn, mock) = open();
        let count = Arc::new(AtomicUsize::new(0));
        conn.listen("jobs", Some(counting_handler(&count))).unwrap();

        let guest = Guest::new("transaction", "work");
        conn.register_transaction(&guest).unwrap();
        mock.script().notify("jobs", "", 1);
        assert_eq!(conn.get_notifs().unwrap(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        conn.unregister_transaction(&guest);
        assert_eq!(conn.get_notifs().unwrap(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_notifs_on_lost_connection() {
        let (mut conn, mock) = open();
        mock.script().consume_fails = true;
        assert!(matches!(conn.get_notifs(), Err(Error::BrokenConnection(_))));
    }

    #[test]
    fn test_await_notification_waits_once() {
        let (mut conn, mock) = open();
        let count = Arc::new(AtomicUsize::new(0));
        conn.listen("jobs", Some(counting_handler(&count))).unwrap();

        assert_eq!(conn.await_notification_timeout(Duration::from_millis(5)).unwrap(), 0);
        mock.script().arrive_on_wait.push_back(Notification {
            channel: "jobs".into(),
            payload: "x".into(),
            backend_pid: 3,
        });
        assert_eq!(conn.await_notification().unwrap(), 1);
        assert_eq!(
            mock.script().waits,
            vec![Duration::from_millis(5), DEFAULT_NOTIFICATION_WAIT]
        );

        mock.script().notify("jobs", "y", 3);
        assert_eq!(conn.await_notification().unwrap(), 1);
        assert_eq!(mock.script().waits.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_transaction_slot_is_exclusive() {
        let (mut conn, _mock) = open();
        let seen = collect_notices(&conn);
        let first = Guest::new("transaction", "a");
        let second = Guest::new("transaction", "b");
        conn.register_transaction(&first).unwrap();
        match conn.register_transaction(&second) {
            Err(Error::Usage(msg)) => assert_eq!(
                msg,
                "Started new transaction 'b' while transaction 'a' is still active."
            ),
            other => panic!("unexpected: {other:?}"),
        }

        conn.unregister_transaction(&second);
        assert!(conn.current_transaction().is_none());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Usage error: Closed transaction 'b'; expected to close transaction 'a'\n"]
        );
    }

    #[test]
    fn test_close_reports_leftovers() {
        let (mut conn, _mock) = open();
        let seen = collect_notices(&conn);
        conn.register_transaction(&Guest::new("transaction", "t1")).unwrap();
        conn.add_receiver(recorder("ch", false)).unwrap();
        conn.close();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "Closing connection while transaction 't1' is still open.\n",
                "Closing connection with outstanding receivers.\n",
            ]
        );
    }

    #[test]
    fn test_take_and_assign() {
        let (mut conn, mock) = open();
        let guest = Guest::new("transaction", "");
        conn.register_transaction(&guest).unwrap();
        assert!(matches!(conn.take(), Err(Error::Usage(_))));
        conn.unregister_transaction(&guest);

        let mut moved = conn.take().unwrap();
        assert!(!conn.is_open());
        assert!(moved.is_open());

        let (other, other_mock) = open();
        moved.assign(other).unwrap();
        assert_eq!(mock.script().finished, 1);
        assert_eq!(other_mock.script().finished, 0);
        assert!(moved.is_open());

        let receiver = recorder("ch", false);
        moved.add_receiver(receiver).unwrap();
        let (replacement, _) = open();
        assert!(matches!(moved.assign(replacement), Err(Error::Usage(_))));
    }

    #[test]
    fn test_read_copy_line_codes() {
        let (mut conn, mock) = open();
        mock.script().copy_reads.extend([
            CopyRead::Line("1\talice"),
            CopyRead::Line(""),
            CopyRead::Code(-1),
        ]);
        assert_eq!(conn.read_copy_line().unwrap(), Some(b"1\talice".to_vec()));
        assert_eq!(conn.read_copy_line().unwrap(), Some(Vec::new()));

        // End of data: the trailing result is fetched and checked.
        mock.script().pending.push_back(RawResult::command("COPY 2"));
        assert_eq!(conn.read_copy_line().unwrap(), None);
        assert!(mock.script().pending.is_empty());

        mock.script().copy_reads.push_back(CopyRead::Code(0));
        assert!(matches!(conn.read_copy_line(), Err(Error::Internal(_))));

        mock.script().copy_reads.push_back(CopyRead::Code(-2));
        mock.script().error_message = "socket closed".into();
        match conn.read_copy_line() {
            Err(Error::Failure(msg)) => assert_eq!(msg, "Reading of table data failed: socket closed"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_copy_end_result_is_checked() {
        let (mut conn, mock) = open();
        mock.script().pending.push_back(RawResult::from_error(ErrorFields {
            code: Some("22P04".into()),
            message: Some("bad copy file format".into()),
            ..ErrorFields::default()
        }));
        match conn.end_copy_write() {
            Err(Error::Sql { query, .. }) => assert_eq!(query, END_COPY),
            other => panic!("unexpected: {other:?}"),
        }

        mock.script().pending.push_back(RawResult::command("COPY 1"));
        let result = conn.end_copy_write().unwrap();
        assert_eq!(result.affected_rows(), 1);
        assert!(result.is_empty());
        assert_eq!(mock.script().copy_end, vec![None, None]);
    }

    #[test]
    fn test_write_copy_line_codes() {
        let (mut conn, mock) = open();
        conn.write_copy_line(b"abc").unwrap();
        assert_eq!(
            mock.script().copy_writes,
            vec![b"abc".to_vec(), b"\n".to_vec()]
        );

        mock.script().put_data_codes.extend([1, -1]);
        mock.script().error_message = "no COPY in progress".into();
        match conn.write_copy_line(b"x") {
            Err(Error::Failure(msg)) => assert_eq!(msg, "Error writing to table: no COPY in progress"),
            other => panic!("unexpected: {other:?}"),
        }

        mock.script().put_end_codes.extend([0, 7, -1]);
        assert!(matches!(conn.end_copy_write(), Err(Error::Internal(_))));
        assert!(matches!(conn.end_copy_write(), Err(Error::Internal(m)) if m.contains('7')));
        assert!(matches!(conn.end_copy_write(), Err(Error::Failure(_))));
    }

    #[test]
    fn test_focus_blocks_exec() {
        let (mut conn, _mock) = open();
        let stream = Guest::new("copy_out", "");
        conn.register_focus(&stream).unwrap();
        match conn.exec("SELECT 1") {
            Err(Error::Usage(msg)) => assert_eq!(msg, "Started new query while copy_out is still active."),
            other => panic!("unexpected: {other:?}"),
        }
        conn.unregister_focus(&stream);
        assert!(conn.exec("SELECT 1").is_ok());
    }

    #[test]
    fn test_session_helpers() {
        let (mut conn, mock) = open();
        assert_eq!(conn.adorn_name(""), "x1");
        assert_eq!(conn.adorn_name("cursor"), "cursor_2");

        conn.set_variable("search_path", "public").unwrap();
        mock.script().respond(vec![RawResult {
            columns: vec![crate::protocol::backend::ColumnInfo {
                name: "search_path".into(),
                type_oid: 25,
                format: crate::protocol::types::FormatCode::Text,
            }],
            rows: vec![vec![Some(b"public".to_vec())]],
            ..RawResult::new(ExecStatus::TuplesOk)
        }]);
        assert_eq!(conn.get_variable("search_path").unwrap(), "public");

        conn.prepare("find", "SELECT $1").unwrap();
        conn.exec_prepared("find", &Params::new().text("1")).unwrap();
        conn.unprepare("find").unwrap();
        assert_eq!(
            mock.script().sent,
            vec![
                "SET \"search_path\"=public",
                "SHOW \"search_path\"",
                "PREPARE find AS SELECT $1",
                "EXECUTE find",
                "DEALLOCATE \"find\"",
            ]
        );
        assert_eq!(mock.script().param_counts, vec![1]);

        assert_eq!(conn.get_client_encoding().unwrap(), "UTF8");
        assert_eq!(conn.encoding_group().unwrap(), EncodingGroup::Utf8);
        assert_eq!(conn.quote("it's").unwrap(), "'it''s'");
        assert_eq!(conn.quote_table(&["public", "t"]).unwrap(), "\"public\".\"t\"");
        assert_eq!(conn.unesc_raw(&conn.esc_raw(&[0, 255])).unwrap(), vec![0, 255]);
        assert_eq!(conn.dbname(), Some("mockdb"));
        assert_eq!(conn.backend_pid(), 4242);
        assert_eq!(conn.sock(), Some(7));

        conn.close();
        assert!(matches!(conn.encoding_group(), Err(Error::BrokenConnection(_))));
        assert_eq!(conn.err_msg(), "No connection to database");
        assert!(matches!(conn.exec("SELECT 1"), Err(Error::BrokenConnection(_))));
    }

    #[test]
    fn test_parameter_count_is_unsigned() {
        let (mut conn, mock) = open();
        let mut params = Params::new();
        for _ in 0..40_000 {
            params = params.null();
        }
        conn.exec_params("SELECT 1", &params).unwrap();
        assert_eq!(mock.script().param_counts, vec![40_000]);

        for _ in 40_000..65_536 {
            params = params.null();
        }
        assert!(matches!(
            conn.exec_params("SELECT 1", &params),
            Err(Error::Range(_))
        ));
        assert!(matches!(
            conn.exec_prepared("stmt", &params),
            Err(Error::Range(_))
        ));
        assert_eq!(mock.script().param_counts, vec![40_000]);
    }

    #[test]
    fn test_abort_copy_write_reports_broken_connection() {
        let (mut conn, mock) = open();
        mock.script().pending.push_back(RawResult::from_error(ErrorFields {
            severity: Some("FATAL".into()),
            code: Some("57P01".into()),
            message: Some("terminating connection".into()),
            ..Default::default()
        }));
        let err = conn.abort_copy_write("stop").unwrap_err();
        assert!(err.is_connection_broken());

        mock.script().put_end_codes.push_back(-1);
        assert!(conn.abort_copy_write("stop").is_err());
        assert_eq!(
            mock.script().copy_end,
            vec![Some("stop".to_string()), Some("stop".to_string())]
        );
    }
}
