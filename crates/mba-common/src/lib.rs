//! MBA Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the MBA ingestion workspace.
//!
//! # Overview
//!
//! - **Error Handling**: `MbaError` and the `Result` alias
//! - **Checksums**: streaming content fingerprints used for duplicate detection
//! - **Logging**: tracing subscriber setup shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use mba_common::checksum::Fingerprint;
//! use mba_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<()> {
//!     let digest = Fingerprint::from_file(path)?;
//!     tracing::info!(%digest, "fingerprinted");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use checksum::Fingerprint;
pub use error::{MbaError, Result};
