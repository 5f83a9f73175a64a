//! Convey - credit-based file upload library.
//!
//! Convey moves large files from many concurrent clients to a central
//! server over an authenticated, encrypted, message-oriented transport.
//! Uploads are chunked, flow-controlled with server-issued credit,
//! verified end to end with SHA-256 and resumable across transport drops.
//!
//! # Example
//!
//! ```no_run
//! use convey::{Config, Server};
//! use convey::validate::AcceptAll;
//! use std::path::Path;
//!
//! # async fn run() -> Result<(), convey::UploadError> {
//! let config = Config::load_or_create(Path::new("convey.toml"))?;
//! let server = Server::new(config.server, AcceptAll);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod credit;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod progress;
pub mod retention;
pub mod server;
pub mod storage;
pub mod transport;
pub mod validate;

pub use client::Uploader;
pub use config::Config;
pub use error::{ErrorCode, UploadError};
pub use server::Server;

// Re-export commonly used types for convenience
pub use bytes;
pub use serde_json;
pub use tokio;
