//! Transactions.

use crate::connection::Connection;
use crate::copy::{CopyIn, CopyOut};
use crate::error::{Error, Result};
use crate::guest::Guest;
use crate::result::QueryResult;
use crate::transport::{Params, Transport, WireTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Active,
    Committed,
    Aborted,
}

/// A transaction on a [`Connection`].
///
/// Occupies the connection's transaction slot from `BEGIN` until it is
/// committed, aborted or dropped. Dropping an active transaction rolls it
/// back; problems during that rollback become notices.
pub struct Transaction<'c, T: Transport = WireTransport> {
    conn: &'c mut Connection<T>,
    guest: Guest,
    status: Status,
    registered: bool,
}

impl<T: Transport> std::fmt::Debug for Transaction<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("guest", &self.guest)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<'c, T: Transport> Transaction<'c, T> {
    /// Begin an unnamed transaction.
    pub fn new(conn: &'c mut Connection<T>) -> Result<Self> {
        Self::named(conn, "")
    }

    /// Begin a transaction; `name` only shows up in diagnostics.
    pub fn named(conn: &'c mut Connection<T>, name: &str) -> Result<Self> {
        let guest = Guest::new("transaction", name);
        conn.register_transaction(&guest)?;
        let mut tx = Self {
            conn,
            guest,
            status: Status::Active,
            registered: true,
        };
        if let Err(e) = tx.conn.exec("BEGIN") {
            tx.status = Status::Aborted;
            tx.unregister();
            return Err(e);
        }
        tracing::debug!(tx = %tx.description(), "transaction started");
        Ok(tx)
    }

    pub fn name(&self) -> &str {
        self.guest.name()
    }

    /// `transaction 'name'`, or `transaction`.
    pub fn description(&self) -> String {
        self.guest.describe()
    }

    /// The connection this transaction runs on.
    pub fn conn(&mut self) -> &mut Connection<T> {
        &mut *self.conn
    }

    fn check_active(&self) -> Result<()> {
        if self.status != Status::Active {
            return Err(Error::Usage(
                "Could not execute command: transaction is already closed.".into(),
            ));
        }
        Ok(())
    }

    pub fn exec(&mut self, query: &str) -> Result<QueryResult> {
        self.check_active()?;
        self.conn.exec(query)
    }

    pub fn exec_params(&mut self, query: &str, params: &Params) -> Result<QueryResult> {
        self.check_active()?;
        self.conn.exec_params(query, params)
    }

    pub fn exec_prepared(&mut self, name: &str, params: &Params) -> Result<QueryResult> {
        self.check_active()?;
        self.conn.exec_prepared(name, params)
    }

    /// Start `COPY ... TO STDOUT` inside this transaction.
    pub fn copy_out(&mut self, query: &str) -> Result<CopyOut<'_, T>> {
        self.check_active()?;
        self.conn.copy_out(query)
    }

    /// Start `COPY ... FROM STDIN` inside this transaction.
    pub fn copy_in(&mut self, query: &str) -> Result<CopyIn<'_, T>> {
        self.check_active()?;
        self.conn.copy_in(query)
    }

    /// Commit.
    ///
    /// Committing twice only produces a notice; committing an aborted
    /// transaction is a usage error.
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            Status::Active => {}
            Status::Aborted => {
                return Err(Error::Usage(format!(
                    "Attempt to commit previously aborted {}",
                    self.description()
                )));
            }
            Status::Committed => {
                self.conn
                    .process_notice(&format!("{} committed more than once.\n", self.description()));
                return Ok(());
            }
        }

        if let Some(focus) = self.conn.current_focus() {
            return Err(Error::Failure(format!(
                "Attempt to commit {} with {} still open.",
                self.description(),
                focus.describe()
            )));
        }
        if !self.conn.is_open() {
            return Err(Error::BrokenConnection(
                "Broken connection to backend; cannot complete transaction.".into(),
            ));
        }

        if let Err(e) = self.conn.exec("COMMIT") {
            self.status = Status::Aborted;
            self.unregister();
            return Err(e);
        }
        self.status = Status::Committed;
        self.unregister();
        tracing::debug!(tx = %self.description(), "transaction committed");
        Ok(())
    }

    /// Roll back.
    ///
    /// Aborting twice is harmless; aborting a committed transaction is a
    /// usage error. A failing `ROLLBACK` is reported as a notice.
    pub fn abort(&mut self) -> Result<()> {
        match self.status {
            Status::Active => {
                if let Err(e) = self.conn.exec("ROLLBACK") {
                    self.conn.process_notice(&format!("{e}\n"));
                }
                self.status = Status::Aborted;
                tracing::debug!(tx = %self.description(), "transaction aborted");
            }
            Status::Aborted => return Ok(()),
            Status::Committed => {
                return Err(Error::Usage(format!(
                    "Attempt to abort previously committed {}.",
                    self.description()
                )));
            }
        }
        self.unregister();
        Ok(())
    }

    fn unregister(&mut self) {
        if self.registered {
            self.registered = false;
            self.conn.unregister_transaction(&self.guest);
        }
    }
}

impl<T: Transport> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        if self.status == Status::Active {
            if let Some(focus) = self.conn.current_focus() {
                let text = format!(
                    "Closing {} with {} still open.\n",
                    self.description(),
                    focus.describe()
                );
                self.conn.process_notice(&text);
            }
            if self.conn.is_open() {
                // abort() only fails on a committed transaction.
                let _ = self.abort();
            }
        }
        if self.registered {
            self.conn
                .process_notice(&format!("{} was never closed properly!\n", self.description()));
            self.unregister();
        }
    }
}
