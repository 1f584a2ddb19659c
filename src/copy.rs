//! COPY streams.
//!
//! A stream occupies its connection's focus slot for as long as it is open,
//! so ordinary commands on the same connection are refused until it ends.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::result::QueryResult;
use crate::transport::{ExecStatus, Transport, WireTransport};

/// Reason sent to the server when a [`CopyIn`] is dropped unfinished.
const ABANDONED: &str = "COPY abandoned by client";

fn start_copy<T: Transport>(
    conn: &mut Connection<T>,
    query: &str,
    expected: ExecStatus,
    kind: &'static str,
) -> Result<Guest> {
    let result = conn.exec(query)?;
    if result.status() != expected {
        return Err(Error::Usage(format!(
            "Query '{query}' did not start a {kind} stream (status {:?}).",
            result.status()
        )));
    }
    let guest = Guest::new(kind, "");
    conn.register_focus(&guest)?;
    tracing::debug!(kind, "COPY started");
    Ok(guest)
}

/// Lines coming out of a `COPY ... TO STDOUT`.
///
/// Also an iterator over `Result<Vec<u8>>`. Dropping the stream before the
/// end reads and discards the rest.
pub struct CopyOut<'c, T: Transport = WireTransport> {
    conn: &'c mut Connection<T>,
    guest: Guest,
    done: bool,
}

impl<'c, T: Transport> CopyOut<'c, T> {
    pub(crate) fn start(conn: &'c mut Connection<T>, query: &str) -> Result<Self> {
        let guest = start_copy(conn, query, ExecStatus::CopyOut, "copy_out")?;
        Ok(Self {
            conn,
            guest,
            done: false,
        })
    }

    /// Next line without its terminator, `None` once the data is exhausted.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let line = self.conn.read_copy_line();
        if !matches!(line, Ok(Some(_))) {
            self.close();
        }
        line
    }

    fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.conn.unregister_focus(&self.guest);
        }
    }
}

impl<T: Transport> Iterator for CopyOut<'_, T> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_line().transpose()
    }
}

impl<T: Transport> Drop for CopyOut<'_, T> {
    fn drop(&mut self) {
        while !self.done {
            if let Err(e) = self.read_line() {
                self.conn.process_notice(&format!("{e}\n"));
            }
        }
    }
}

/// Lines going into a `COPY ... FROM STDIN`.
///
/// Call [`finish`](Self::finish) to complete the command. Dropping the
/// stream unfinished makes the server fail the COPY.
pub struct CopyIn<'c, T: Transport = WireTransport> {
    conn: &'c mut Connection<T>,
    guest: Guest,
    done: bool,
}

impl<'c, T: Transport> CopyIn<'c, T> {
    pub(crate) fn start(conn: &'c mut Connection<T>, query: &str) -> Result<Self> {
        let guest = start_copy(conn, query, ExecStatus::CopyIn, "copy_in")?;
        Ok(Self {
            conn,
            guest,
            done: false,
        })
    }

    /// Send one line; the terminator is added.
    pub fn write_line(&mut self, line: impl AsRef<[u8]>) -> Result<()> {
        if self.done {
            return Err(Error::Usage("Writing to a COPY stream that has ended.".into()));
        }
        self.conn.write_copy_line(line.as_ref())
    }

    /// End the data and return the command's result.
    pub fn finish(mut self) -> Result<QueryResult> {
        self.done = true;
        let result = self.conn.end_copy_write();
        self.conn.unregister_focus(&self.guest);
        result
    }
}

impl<T: Transport> Drop for CopyIn<'_, T> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            tracing::debug!("COPY IN abandoned");
            if let Err(e) = self.conn.abort_copy_write(ABANDONED) {
                self.conn.process_notice(&format!("{e}\n"));
            }
            self.conn.unregister_focus(&self.guest);
        }
    }
}
