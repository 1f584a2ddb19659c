//! Session layer for PostgreSQL connections.
//!
//! # Features
//!
//! - **Connection lifecycle**: blocking and non-blocking establishment, version gate, idempotent close
//! - **Notices**: server and client-side notices fan out through a shared [`NoticeHub`]
//! - **Notifications**: `LISTEN`/`NOTIFY` with per-channel receivers and handlers
//! - **COPY streaming**: line-oriented [`CopyOut`] and [`CopyIn`]
//! - **Encoding-aware escaping**: literals, identifiers, `bytea` and composite values
//!
//! # Example
//!
//! ```no_run
//! use pg_session::{Connection, Notification, Opts};
//!
//! fn main() -> pg_session::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut conn = Connection::new(opts)?;
//!
//!     let result = conn.exec("SELECT 1 AS num")?;
//!     println!("num = {:?}", result.one_field()?);
//!
//!     conn.listen(
//!         "jobs",
//!         Some(Box::new(|n: &Notification| println!("job: {}", n.payload))),
//!     )?;
//!     conn.await_notification()?;
//!
//!     conn.close();
//!     Ok(())
//! }
//! ```

#![feature(io_error_inprogress)]

pub mod connecting;
pub mod connection;
pub mod copy;
pub mod encoding;
pub mod error;
pub mod guest;
pub mod notice;
pub mod notification;
pub mod opts;
pub mod protocol;
pub mod result;
pub mod transaction;
pub mod transport;

pub use connecting::Connecting;
pub use connection::{Connection, DEFAULT_NOTIFICATION_WAIT};
pub use copy::{CopyIn, CopyOut};
pub use encoding::EncodingGroup;
pub use encoding::composite::{CompositeField, parse_composite, render_composite};
pub use error::{Error, ErrorFields, Result};
pub use guest::{Guest, GuestSlot};
pub use notice::{NoticeHandler, NoticeHub, NoticeObserver};
pub use notification::{BoxError, Notification, NotificationHandler, NotificationReceiver};
pub use opts::{Opts, SslMode};
pub use protocol::backend::ColumnInfo;
pub use protocol::types::{FormatCode, Oid, TransactionStatus};
pub use result::{QueryResult, Row};
pub use transaction::Transaction;
pub use transport::{
    CancelToken, ConnStatus, ExecStatus, NoticeProcessor, Params, PollingStatus, RawResult,
    Transport, WireTransport,
};
