//! Error types for pg-session.

use thiserror::Error;

/// Result type for pg-session operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
}

impl ErrorFields {
    /// Severity, preferring the non-localized spelling.
    pub fn severity(&self) -> Option<&str> {
        self.severity_non_localized
            .as_deref()
            .or(self.severity.as_deref())
    }

    /// Render the fields the way the server's notice text reads:
    /// `SEVERITY:  message`, followed by DETAIL and HINT lines.
    pub fn to_notice_text(&self) -> String {
        let mut text = String::new();
        if let Some(severity) = &self.severity {
            text.push_str(severity);
            text.push_str(":  ");
        }
        if let Some(message) = &self.message {
            text.push_str(message);
        }
        text.push('\n');
        if let Some(detail) = &self.detail {
            text.push_str("DETAIL:  ");
            text.push_str(detail);
            text.push('\n');
        }
        if let Some(hint) = &self.hint {
            text.push_str("HINT:  ");
            text.push_str(hint);
            text.push('\n');
        }
        text
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pg-session.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection lost or never valid. Further commands are futile until reconnect.
    #[error("Broken connection: {0}")]
    BrokenConnection(String),

    /// Server or transport rejected an operation; the connection may still be usable.
    #[error("Failure: {0}")]
    Failure(String),

    /// Server-reported error for a specific command.
    #[error("PostgreSQL error: {fields} [query: {query}]")]
    Sql {
        /// Parsed error fields
        fields: ErrorFields,
        /// Text (or description) of the command that failed
        query: String,
    },

    /// Caller violated a documented precondition.
    #[error("Usage error: {0}")]
    Usage(String),

    /// Server or protocol version below what this crate supports.
    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Malformed or mismatched textual data.
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// A value does not fit the integer width a transport call requires.
    #[error("Range error: {0}")]
    Range(String),

    /// The transport returned something its contract says is impossible.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::BrokenConnection(_) => true,
            Error::Sql { fields, .. } => {
                // FATAL and PANIC errors indicate connection is broken
                matches!(fields.severity(), Some("FATAL") | Some("PANIC"))
            }
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Sql { fields, .. } => fields.code.as_deref(),
            _ => None,
        }
    }

    /// Classify a server error report by SQLSTATE class.
    ///
    /// Class `08` (connection exception) becomes [`Error::BrokenConnection`],
    /// class `0A` (feature not supported) becomes [`Error::FeatureNotSupported`].
    pub fn from_server(fields: ErrorFields, query: &str) -> Self {
        let message = fields.message.clone().unwrap_or_default();
        match fields.code.as_deref().and_then(|c| c.get(..2)) {
            Some("08") => Error::BrokenConnection(message),
            Some("0A") => Error::FeatureNotSupported(message),
            _ => Error::Sql {
                fields,
                query: query.to_string(),
            },
        }
    }
}

/// Checked narrowing cast that reports which quantity overflowed.
pub(crate) fn check_cast<To, From>(value: From, description: &str) -> Result<To>
where
    To: TryFrom<From>,
    From: Copy + std::fmt::Display,
{
    To::try_from(value)
        .map_err(|_| Error::Range(format!("Cast overflow: {description} ({value})")))
}

impl From<core::convert::Infallible> for Error {
    fn from(never: core::convert::Infallible) -> Self {
        match never {}
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}
