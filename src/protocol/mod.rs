//! PostgreSQL wire protocol (version 3.0) messages.

pub mod auth;
pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;
