//! Connection options.

use std::time::Duration;

use no_panic::no_panic;
use url::Url;

use crate::error::Error;

/// SSL connection mode.
///
/// No TLS implementation is bundled: `Prefer` connects in plaintext and
/// `Require` is refused before any connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Use SSL when available, plaintext otherwise
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

/// Connection options for PostgreSQL.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number for the PostgreSQL server.
    ///
    /// Default: `5432`
    pub port: u16,

    /// Unix socket path. Takes precedence over `host`.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Database name to use.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Application name to report to the server.
    ///
    /// Default: `None`
    pub application_name: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Client encoding requested at startup.
    ///
    /// Default: `"UTF8"`
    pub client_encoding: String,

    /// Limit on establishing the connection, startup included.
    ///
    /// Default: `None`
    pub connect_timeout: Option<Duration>,

    /// Additional startup parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 5432,
            socket: None,
            user: String::new(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            client_encoding: String::from("UTF8"),
            connect_timeout: None,
            params: Vec::new(),
        }
    }
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@]host[:port][/database][?param1=value1&param2=value2&..]`
    ///
    /// Supported query parameters:
    /// - `sslmode`: disable, prefer, require
    /// - `application_name`: application name
    /// - `client_encoding`: encoding name sent at startup
    /// - `connect_timeout`: seconds (non-negative integer, 0 = no limit)
    /// - `host`: a path starting with `/` selects a Unix socket
    ///
    /// Anything else is passed to the server as a startup parameter.
    #[no_panic]
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
            return Err(Error::Usage(format!(
                "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(5432),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            database: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "sslmode" => {
                    opts.ssl_mode = match value.as_ref() {
                        "disable" => SslMode::Disable,
                        "prefer" => SslMode::Prefer,
                        "require" => SslMode::Require,
                        _ => {
                            return Err(Error::Usage(format!(
                                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {}",
                                value
                            )));
                        }
                    };
                }
                "application_name" => {
                    opts.application_name = Some(value.to_string());
                }
                "client_encoding" => {
                    opts.client_encoding = value.to_string();
                }
                "connect_timeout" => {
                    let seconds: u64 = value.parse().map_err(|_| {
                        Error::Usage(format!("Invalid connect_timeout: {}", value))
                    })?;
                    opts.connect_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
                }
                "host" if value.starts_with('/') => {
                    opts.socket = Some(format!("{}/.s.PGSQL.{}", value, opts.port));
                }
                _ => {
                    opts.params.push((key.to_string(), value.to_string()));
                }
            }
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    #[no_panic]
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::Usage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}

impl TryFrom<String> for Opts {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}
