//! Strata Uploadr Library
//!
//! Direct-to-cloud resumable uploads. Files travel straight from the client
//! to the storage provider over pre-signed, time-limited requests; the
//! application server authorizes each step but never proxies a byte.
//!
//! # Features
//!
//! - **Five residencies**: Amazon S3, Google Cloud Storage, Microsoft Azure,
//!   OpenStack Swift and Rackspace Cloud Files
//! - **Resumable**: chunked uploads survive crashes and reconnects
//! - **Credential-free clients**: signing stays server-side
//! - **Pause/resume/abort**: a full session state machine
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use strata_uploadr::api::{AuthorizationClient, FileParams};
//! use strata_uploadr::hash::Md5HashService;
//! use strata_uploadr::session::{ProfileRegistry, UploadDescriptor, UploadSession};
//! use strata_uploadr::transport::HttpTransport;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let http = reqwest::Client::new();
//!     let file = FileParams {
//!         file_name: "video.mkv".into(),
//!         file_size: 21 * 1024 * 1024,
//!         file_id: None,
//!         file_path: None,
//!         parameters: None,
//!     };
//!     let endpoint = "https://app.example.com/uploads";
//!
//!     let residence = AuthorizationClient::check_provider(&http, endpoint, &file).await?;
//!     let profile = ProfileRegistry::default()
//!         .get(&residence)
//!         .ok_or_else(|| anyhow::anyhow!("unknown residence {residence}"))?;
//!
//!     let session = UploadSession::new(
//!         AuthorizationClient::new(http.clone(), endpoint, file),
//!         Arc::new(HttpTransport::new(http)),
//!         Arc::new(Md5HashService),
//!         profile,
//!         UploadDescriptor {
//!             file_name: "video.mkv".into(),
//!             file_size: 21 * 1024 * 1024,
//!             file_path: None,
//!             source: "video.mkv".into(),
//!         },
//!     );
//!     session.start().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod chunk;
pub mod config;
pub mod hash;
pub mod manifest;
pub mod session;
pub mod signer;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use session::{SessionState, UploadSession};
pub use signer::{Signer, SignerRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
