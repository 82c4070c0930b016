//! ember: a single-reactor, multi-worker HTTP/1.1 static-file server.
//!
//! One thread owns the epoll instance and the idle-connection timer and
//! dispatches per-connection read/process/write stages to a fixed worker
//! pool. Form-encoded `POST /login` and `POST /register` run against a
//! PostgreSQL-backed user table through [`ember_pg`].

pub mod blockqueue;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod epoll;
pub mod error;
pub mod log;
pub mod request;
pub mod response;
pub mod server;
pub mod syscalls;
pub mod threadpool;
pub mod timer;

pub use config::ServerConfig;
pub use error::{EmberError, EmberResult};
pub use server::WebServer;
