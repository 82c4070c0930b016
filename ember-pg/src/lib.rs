//! # ember-pg
//!
//! A small synchronous PostgreSQL driver for the ember web server.
//!
//! The server's workers run blocking read/process/write stages, so the
//! driver is deliberately blocking too: plain `TcpStream`, the simple query
//! protocol, text-format results. Connections are shared through a
//! fixed-capacity [`PgPool`] with borrow/return semantics.
//!
//! ## Features
//! - **Startup + password auth**: cleartext and `md5` responses.
//! - **Simple query protocol**: `query` for rows, `execute` for counts.
//! - **Blocking pool**: `acquire` parks the caller until a handle is free;
//!   the [`PooledConn`] guard returns the handle on every exit path.

pub mod codec;
pub mod connection;
pub mod error;
pub mod pool;
pub mod row;

pub use connection::{PgConfig, PgConnection};
pub use error::{PgError, PgResult};
pub use pool::{PgPool, PooledConn};
pub use row::Row;
