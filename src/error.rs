//! Error types for mailbox-sync

use std::fmt;
use thiserror::Error;

/// Which mailbox of a sync run an error or event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Target => f.write_str("target"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Delete failed: {0}")]
    Delete(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{side} mailbox: {source}")]
    Mailbox {
        side: Side,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the failing side to an error.
    #[must_use]
    pub fn on(self, side: Side) -> Self {
        match self {
            already @ Self::Mailbox { .. } => already,
            other => Self::Mailbox {
                side,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any side annotation removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Mailbox { source, .. } => source.root(),
            other => other,
        }
    }

    /// The side this error was attributed to, if any.
    #[must_use]
    pub const fn side(&self) -> Option<Side> {
        match self {
            Self::Mailbox { side, .. } => Some(*side),
            _ => None,
        }
    }

    /// Whether the error must abort a run.
    ///
    /// Configuration, authentication, transport and folder errors are
    /// fatal. Protocol-level failures of a single command (a rejected
    /// FETCH, a failed STORE) only affect the message being processed.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::Config(_)
                | Self::Auth(_)
                | Self::Connection(_)
                | Self::Tls(_)
                | Self::Io(_)
                | Self::FolderNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
