use std::io;

use thiserror::Error;

/// Central error type for the ember engine.
#[derive(Debug, Error)]
pub enum EmberError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed HTTP request; surfaces to the client as 400.
    #[error("malformed request: {0}")]
    Parse(String),

    /// Database layer failure; auth degrades to a failed verification.
    #[error("database error: {0}")]
    Database(#[from] ember_pg::PgError),

    /// Active connection count reached the configured ceiling.
    #[error("server at connection capacity")]
    CapacityExhausted,
}

impl EmberError {
    /// True when the error is a recoverable would-block condition that the
    /// caller handles by re-arming the fd.
    pub fn is_would_block(&self) -> bool {
        matches!(self, EmberError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub type EmberResult<T> = Result<T, EmberError>;
