//! docload Common Library
//!
//! Shared error handling and logging for the docload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`DocloadError`] and the [`Result`] alias used by
//!   ambient code (configuration, file access)
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`], the single
//!   place where the `tracing` subscriber is installed
//!
//! # Example
//!
//! ```no_run
//! use docload_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("docload started");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;

pub use error::{DocloadError, Result};
