//! Validated query results.

use std::fmt;
use std::sync::Arc;

use crate::encoding::EncodingGroup;
use crate::error::{Error, Result};
use crate::notice::NoticeHub;
use crate::protocol::backend::{ColumnInfo, rows_affected};
use crate::transport::{ExecStatus, RawResult};

struct Inner {
    raw: RawResult,
    query: String,
    notices: NoticeHub,
    encoding: EncodingGroup,
}

/// The outcome of one command.
///
/// Cheap to clone; clones share the same response. A result keeps the
/// session's [`NoticeHub`] alive, so problems found while reading it are
/// still reported as notices after the connection has been closed.
#[derive(Clone)]
pub struct QueryResult {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("status", &self.inner.raw.status)
            .field("query", &self.inner.query)
            .field("rows", &self.inner.raw.rows.len())
            .field("columns", &self.inner.raw.columns.len())
            .finish()
    }
}

impl QueryResult {
    pub(crate) fn new(
        raw: RawResult,
        query: &str,
        notices: NoticeHub,
        encoding: EncodingGroup,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                raw,
                query: query.to_string(),
                notices,
                encoding,
            }),
        }
    }

    /// Turn an error response into an [`Error`].
    pub(crate) fn check_status(&self) -> Result<()> {
        let raw = &self.inner.raw;
        match raw.status {
            ExecStatus::FatalError => {
                let fields = raw.error.clone().unwrap_or_default();
                Err(Error::from_server(fields, &self.inner.query))
            }
            ExecStatus::BadResponse => Err(Error::Failure(format!(
                "Unexpected response from server for query '{}'.",
                self.inner.query
            ))),
            _ => Ok(()),
        }
    }

    fn out_of_range(&self, message: String) -> Error {
        self.inner.notices.process_notice(&format!("{message}\n"));
        Error::Range(message)
    }

    pub fn status(&self) -> ExecStatus {
        self.inner.raw.status
    }

    /// Text of the command that produced this result.
    pub fn query(&self) -> &str {
        &self.inner.query
    }

    /// Encoding group in effect when the result was received.
    pub fn encoding_group(&self) -> EncodingGroup {
        self.inner.encoding
    }

    /// Command tag reported by the server (`"INSERT 0 1"`, `"SELECT 3"`, ...).
    pub fn command_tag(&self) -> &str {
        &self.inner.raw.command_tag
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.inner.raw.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.raw.rows.is_empty()
    }

    /// Number of columns.
    pub fn columns(&self) -> usize {
        self.inner.raw.columns.len()
    }

    pub fn column_info(&self) -> &[ColumnInfo] {
        &self.inner.raw.columns
    }

    pub fn column_name(&self, col: usize) -> Result<&str> {
        match self.inner.raw.columns.get(col) {
            Some(info) => Ok(&info.name),
            None => Err(self.out_of_range(format!(
                "Invalid column number: {col} (maximum is {}).",
                self.columns() as isize - 1
            ))),
        }
    }

    /// Position of the column called `name`.
    pub fn column_number(&self, name: &str) -> Result<usize> {
        self.inner
            .raw
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| self.out_of_range(format!("Unknown column name: '{name}'.")))
    }

    /// Raw field bytes; `None` is SQL NULL.
    pub fn get(&self, row: usize, col: usize) -> Result<Option<&[u8]>> {
        let Some(fields) = self.inner.raw.rows.get(row) else {
            return Err(self.out_of_range(format!(
                "Row number {row} is out of range (result has {} rows).",
                self.len()
            )));
        };
        match fields.get(col) {
            Some(value) => Ok(value.as_deref()),
            None => Err(self.out_of_range(format!(
                "Invalid column number: {col} (maximum is {}).",
                self.columns() as isize - 1
            ))),
        }
    }

    /// Field as text; `None` is SQL NULL.
    pub fn get_str(&self, row: usize, col: usize) -> Result<Option<&str>> {
        self.get(row, col)?
            .map(|bytes| {
                simdutf8::basic::from_utf8(bytes).map_err(|_| {
                    Error::Conversion(format!(
                        "Field ({row}, {col}) of query '{}' is not valid UTF-8.",
                        self.inner.query
                    ))
                })
            })
            .transpose()
    }

    /// One row of the result.
    pub fn row(&self, row: usize) -> Result<Row<'_>> {
        if row >= self.len() {
            return Err(self.out_of_range(format!(
                "Row number {row} is out of range (result has {} rows).",
                self.len()
            )));
        }
        Ok(Row {
            result: self,
            index: row,
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> {
        (0..self.len()).map(|index| Row {
            result: self,
            index,
        })
    }

    /// Rows inserted, updated, deleted, copied or selected, 0 if the command
    /// reports no count.
    pub fn affected_rows(&self) -> u64 {
        rows_affected(&self.inner.raw.command_tag).unwrap_or(0)
    }

    /// Fail unless the result has exactly `n` rows.
    pub fn expect_rows(&self, n: usize) -> Result<&Self> {
        let actual = self.len();
        if actual != n {
            return Err(Error::Range(format!(
                "Expected {n} row(s) from query '{}', got {actual}.",
                self.inner.query
            )));
        }
        Ok(self)
    }

    /// Fail unless the result has exactly `n` columns.
    pub fn expect_columns(&self, n: usize) -> Result<&Self> {
        let actual = self.columns();
        if actual != n {
            return Err(Error::Usage(format!(
                "Expected {n} column(s) from query '{}', got {actual}.",
                self.inner.query
            )));
        }
        Ok(self)
    }

    /// Fail unless the result has no rows.
    pub fn no_rows(&self) -> Result<&Self> {
        let actual = self.len();
        if actual != 0 {
            return Err(Error::Range(format!(
                "Expected no rows from query '{}', got {actual}.",
                self.inner.query
            )));
        }
        Ok(self)
    }

    /// The only row of a one-row result.
    pub fn one_row(&self) -> Result<Row<'_>> {
        self.expect_rows(1)?;
        self.row(0)
    }

    /// The only field of a one-row, one-column result.
    pub fn one_field(&self) -> Result<Option<&str>> {
        self.expect_columns(1)?;
        self.expect_rows(1)?;
        self.get_str(0, 0)
    }
}

/// A row borrowed from a [`QueryResult`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'r> {
    result: &'r QueryResult,
    index: usize,
}

impl<'r> Row<'r> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.result.columns()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, col: usize) -> Result<Option<&'r [u8]>> {
        self.result.get(self.index, col)
    }

    pub fn get_str(&self, col: usize) -> Result<Option<&'r str>> {
        self.result.get_str(self.index, col)
    }

    /// Field by column name.
    pub fn get_named(&self, name: &str) -> Result<Option<&'r [u8]>> {
        let col = self.result.column_number(name)?;
        self.get(col)
    }
}
