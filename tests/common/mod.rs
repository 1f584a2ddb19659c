use std::env;

use pg_session::Connection;

/// Connect to `DATABASE_URL`, or `None` when it is unset.
pub fn get_conn() -> Option<Connection> {
    let mut db_url = env::var("DATABASE_URL").ok()?;
    if !db_url.contains("sslmode=") {
        if db_url.contains('?') {
            db_url.push_str("&sslmode=disable");
        } else {
            db_url.push_str("?sslmode=disable");
        }
    }
    Some(Connection::new(db_url.as_str()).expect("Failed to connect"))
}
