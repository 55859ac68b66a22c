//! Error types shared by the archive and XML layers.

use std::io;
use thiserror::Error;

/// Errors produced while reading archives or extracting XML from them.
///
/// Container errors are fatal for a whole listing. Entry and XML errors are
/// scoped to the entry that produced them, so a multi-entry archive can
/// partially succeed.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed archive framing (bad signature, truncated header, ...)
    #[error("Invalid archive: {0}")]
    ContainerFormat(String),

    /// A single entry's payload could not be read
    #[error("Failed to read entry '{name}': {message}")]
    EntryRead { name: String, message: String },

    /// Malformed markup in an XML entry
    #[error("XML syntax error at byte {offset}: {message}")]
    XmlSyntax { offset: u64, message: String },

    /// IO error from the underlying source
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Transport error from a remote source
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub(crate) fn entry(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::EntryRead {
            name: name.into(),
            message: message.into(),
        }
    }

    pub(crate) fn xml(offset: u64, message: impl Into<String>) -> Self {
        Error::XmlSyntax {
            offset,
            message: message.into(),
        }
    }

    /// Whether this error only concerns one entry rather than the whole archive.
    pub fn is_entry_scoped(&self) -> bool {
        matches!(self, Error::EntryRead { .. } | Error::XmlSyntax { .. })
    }
}

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
