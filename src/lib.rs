//! # gonzbee
//!
//! Command-line Usenet binary retriever: point it at NZB manifests and it
//! fetches the referenced articles over pooled, pipelined NNTP
//! connections, decodes the yEnc payloads, and reassembles them into files
//! at the right byte offsets. With PAR2 handling enabled it verifies the
//! result against the recovery set and downloads just enough recovery
//! volumes to cover whatever is damaged or missing.
//!
//! The crate is a binary first, but the engine is a regular library:
//!
//! ```no_run
//! use std::sync::Arc;
//! use gonzbee::job::{JobContext, JobOptions, ParMode};
//! use gonzbee::nntp::{Pool, PoolConfig, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> gonzbee::Result<()> {
//!     let server = ServerConfig {
//!         host: "news.example.com".to_string(),
//!         port: 563,
//!         tls: true,
//!         username: Some("user".to_string()),
//!         password: Some("pass".to_string()),
//!     };
//!     let pool = Arc::new(Pool::new(server, PoolConfig::default()));
//!     let ctx = JobContext::new(pool, JobOptions { par: ParMode::Auto });
//!
//!     let manifest = gonzbee::nzb::parse(&std::fs::read("example.nzb")?)?;
//!     ctx.run(manifest, "example".as_ref()).await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Per-file fan-in reassembly with positioned writes
pub mod assemble;
/// Configuration file handling
pub mod config;
/// Diagnostic HTTP endpoint
pub mod diag;
/// Error types
pub mod error;
/// Job driver orchestrating one NZB
pub mod job;
/// NNTP sessions and the connection pool
pub mod nntp;
/// NZB manifest parsing
pub mod nzb;
/// PAR2 packets, volume selection, and verification
pub mod par2;
/// Streaming yEnc decoder
pub mod yenc;

pub use config::Config;
pub use error::{Error, Result};
