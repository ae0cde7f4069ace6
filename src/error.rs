//! Error types for gonzbee.
//!
//! Each layer defines its own typed error (`NntpError`, `DecodeError`,
//! `Par2Error`) and this module aggregates them into the crate-level
//! [`Error`]. The connection-health classification used by the fetch path
//! lives here so the release-vs-retire decision is encoded in one place.

use std::path::PathBuf;
use thiserror::Error;

use crate::nntp::NntpError;
use crate::par2::Par2Error;
use crate::yenc::DecodeError;

/// Result type alias for gonzbee operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gonzbee
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be read or created
    #[error("configuration error: {0}")]
    Config(String),

    /// NZB manifest could not be parsed or failed validation
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// NNTP transport or protocol error
    #[error("NNTP error: {0}")]
    Nntp(#[from] NntpError),

    /// yEnc payload could not be decoded or verified
    #[error("yEnc decode error: {0}")]
    Decode(#[from] DecodeError),

    /// PAR2 packet stream could not be parsed
    #[error("PAR2 error: {0}")]
    Par2(#[from] Par2Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Output file already exists; the logical file is skipped
    #[error("file exists: {0}")]
    FileExists(PathBuf),
}

impl Error {
    /// Whether the connection a failed fetch ran on must be retired.
    ///
    /// Protocol-level server replies (430 and friends) and payload decode
    /// failures leave the link healthy, so the connection is released back
    /// to the pool. Anything touching the transport itself (socket, TLS,
    /// unexpected EOF) retires it.
    pub fn retires_connection(&self) -> bool {
        match self {
            Error::Nntp(e) => e.is_transport(),
            Error::Decode(_) => false,
            _ => true,
        }
    }
}
