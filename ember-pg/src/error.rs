use thiserror::Error;

/// Errors returned by ember-pg operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error from the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or unexpected message from the server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Authentication failure.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Server-sent ErrorResponse (severity, SQLSTATE code, message).
    #[error("server error {severity} ({code}): {message}")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    /// Connection is closed or in an invalid state.
    #[error("connection closed")]
    ConnectionClosed,

    /// The pool has been shut down; no more handles will be issued.
    #[error("connection pool closed")]
    PoolClosed,
}

pub type PgResult<T> = Result<T, PgError>;
