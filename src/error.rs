//! Error types for norless

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("State store error: {0}")]
    State(String),

    #[error("No such maildir entry: {0}")]
    NotFound(String),

    #[error("Another instance already holds {}", .0.display())]
    LockContention(PathBuf),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether this error should take down the whole account rather
    /// than just the folder being processed.
    #[must_use]
    pub const fn is_account_fatal(&self) -> bool {
        matches!(self, Self::Tls(_) | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
