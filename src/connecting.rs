//! Non-blocking connection establishment.

use std::os::unix::io::RawFd;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::transport::{Transport, WireTransport};

/// A connection attempt in progress.
///
/// Wait until [`sock`](Self::sock) is ready in the direction
/// [`wait_to_read`](Self::wait_to_read) / [`wait_to_write`](Self::wait_to_write)
/// ask for, then call [`process`](Self::process). Once [`done`](Self::done),
/// [`produce`](Self::produce) yields the connection.
///
/// ```no_run
/// # fn main() -> pg_session::Result<()> {
/// let mut attempt = pg_session::Connecting::new("postgres://app@localhost/app")?;
/// while !attempt.done() {
///     // wait for attempt.sock() with poll/epoll/select here
///     attempt.process()?;
/// }
/// let conn = attempt.produce()?;
/// # drop(conn);
/// # Ok(())
/// # }
/// ```
pub struct Connecting<T: Transport = WireTransport> {
    conn: Connection<T>,
    reading: bool,
    writing: bool,
}

impl<T: Transport> std::fmt::Debug for Connecting<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connecting")
            .field("conn", &self.conn)
            .field("reading", &self.reading)
            .field("writing", &self.writing)
            .finish()
    }
}

impl Connecting<WireTransport> {
    /// Start connecting without blocking.
    pub fn new<O: TryInto<Opts>>(opts: O) -> Result<Self>
    where
        Error: From<O::Error>,
    {
        let opts = opts.try_into()?;
        tracing::debug!(host = %opts.host, port = opts.port, "connecting (non-blocking)");
        Self::from_transport(WireTransport::connect_start(opts)?)
    }
}

impl<T: Transport> Connecting<T> {
    /// Take over a transport whose connection attempt has been started, and
    /// advance it once.
    pub fn from_transport(transport: T) -> Result<Self> {
        let mut conn = Connection::from_started(transport)?;
        let (reading, writing) = conn.poll_connect()?;
        Ok(Self {
            conn,
            reading,
            writing,
        })
    }

    /// Advance the attempt. Call after the socket signalled readiness.
    pub fn process(&mut self) -> Result<()> {
        let (reading, writing) = self.conn.poll_connect()?;
        self.reading = reading;
        self.writing = writing;
        Ok(())
    }

    pub fn wait_to_read(&self) -> bool {
        self.reading
    }

    pub fn wait_to_write(&self) -> bool {
        self.writing
    }

    /// Whether the attempt has finished.
    pub fn done(&self) -> bool {
        !self.reading && !self.writing
    }

    /// The socket to wait on, `None` if there is none (yet).
    pub fn sock(&self) -> Option<RawFd> {
        self.conn.sock()
    }

    /// The finished connection.
    ///
    /// Fails with [`Error::Usage`] before [`done`](Self::done); a session the
    /// server is too old for fails like a blocking connect would.
    pub fn produce(self) -> Result<Connection<T>> {
        if !self.done() {
            return Err(Error::Usage(
                "Tried to produce a nonblocking connection before it was done.".into(),
            ));
        }
        let mut conn = self.conn;
        conn.complete_init()?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::transport::{ConnStatus, PollingStatus};

    fn scripted(steps: &[PollingStatus]) -> MockTransport {
        let mock = MockTransport::new();
        mock.script().poll_steps.extend(steps.iter().copied());
        mock
    }

    #[test]
    fn test_poll_until_done() {
        let mock = scripted(&[
            PollingStatus::Reading,
            PollingStatus::Writing,
            PollingStatus::Ok,
        ]);
        let attempt = Connecting::from_transport(mock).unwrap();
        assert!(attempt.wait_to_read());
        assert!(!attempt.done());
        assert!(matches!(attempt.produce(), Err(Error::Usage(_))));

        let mut attempt = Connecting::from_transport(scripted(&[
            PollingStatus::Reading,
            PollingStatus::Writing,
            PollingStatus::Ok,
        ]))
        .unwrap();
        attempt.process().unwrap();
        assert!(attempt.wait_to_write());
        assert!(!attempt.wait_to_read());
        attempt.process().unwrap();
        assert!(attempt.done());
        assert_eq!(attempt.sock(), Some(7));

        let mut conn = attempt.produce().unwrap();
        assert!(conn.is_open());
        assert!(conn.exec("SELECT 1").is_ok());
    }

    #[test]
    fn test_polling_failure_is_broken() {
        let mock = scripted(&[PollingStatus::Reading, PollingStatus::Failed]);
        mock.script().error_message = "could not connect to server".into();
        let mut attempt = Connecting::from_transport(mock).unwrap();
        match attempt.process() {
            Err(Error::BrokenConnection(msg)) => assert_eq!(msg, "could not connect to server"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_active_state_is_internal() {
        let mock = scripted(&[PollingStatus::Active]);
        assert!(matches!(
            Connecting::from_transport(mock),
            Err(Error::Internal(_))
        ));
    }

    #[test]
    fn test_bad_transport_refused_up_front() {
        let mock = MockTransport::new();
        mock.script().status = ConnStatus::Bad;
        assert!(matches!(
            Connecting::from_transport(mock),
            Err(Error::BrokenConnection(_))
        ));
    }

    #[test]
    fn test_old_server_rejected_on_produce() {
        let mock = scripted(&[PollingStatus::Ok]);
        mock.script().server_version = 80400;
        let attempt = Connecting::from_transport(mock.clone()).unwrap();
        assert!(attempt.done());
        assert!(matches!(
            attempt.produce(),
            Err(Error::FeatureNotSupported(_))
        ));
        assert_eq!(mock.script().finished, 1);
    }
}
