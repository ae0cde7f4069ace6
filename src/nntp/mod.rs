//! NNTP client: single sessions and the bounded connection pool.
//!
//! [`session`] implements one authenticated server session with pipelined
//! `GROUP`/`BODY` commands; [`pool`] multiplexes a capped number of those
//! sessions behind `acquire`/`release`/`retire`.

mod pool;
mod session;

pub use pool::{Pool, PoolConfig, PoolStats, Slot};
pub use session::Session;

use thiserror::Error;

/// Connection settings for one NNTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server hostname
    pub host: String,
    /// Server port (119 plain, 563 TLS by convention)
    pub port: u16,
    /// Connect over implicit TLS
    pub tls: bool,
    /// Username for AUTHINFO, if the server requires it
    pub username: Option<String>,
    /// Password for AUTHINFO
    pub password: Option<String>,
}

impl ServerConfig {
    /// `host:port` dial string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// NNTP transport and protocol errors.
#[derive(Debug, Error)]
pub enum NntpError {
    /// The server greeting was not a 2xx line
    #[error("unexpected server greeting: {0}")]
    BadGreeting(String),

    /// AUTHINFO was rejected
    #[error("authentication rejected ({code}): {message}")]
    AuthRejected {
        /// Response code the server sent (481, 482, 502, ...)
        code: u16,
        /// Response text
        message: String,
    },

    /// The server answered a command with an error status
    /// (430 no such article, 411 no such group, ...)
    #[error("server error {code}: {message}")]
    Protocol {
        /// Response code
        code: u16,
        /// Response text
        message: String,
    },

    /// A response line could not be parsed
    #[error("malformed server response: {0:?}")]
    BadResponse(String),

    /// The connection is gone (closed, or broken by an earlier failure)
    #[error("connection closed")]
    ConnectionClosed,

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NntpError {
    /// Whether this error means the underlying connection is unusable.
    ///
    /// Protocol-level rejections arrive on a healthy, still-synchronised
    /// link; everything else indicates transport damage.
    pub fn is_transport(&self) -> bool {
        !matches!(
            self,
            NntpError::Protocol { .. } | NntpError::AuthRejected { .. }
        )
    }
}
