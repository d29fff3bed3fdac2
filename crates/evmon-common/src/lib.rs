//! Event Monitoring Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, error handling and logging setup for the event monitoring
//! workspace.
//!
//! # Overview
//!
//! - **Types**: the event log file descriptor and record value types that flow
//!   through the ingestion pipeline
//! - **Error Handling**: common error and result types
//! - **Logging**: `tracing` subscriber initialization
//!
//! # Example
//!
//! ```no_run
//! use evmon_common::types::EventLogFile;
//!
//! fn describe(file: &EventLogFile) {
//!     for (name, kind) in file.field_names().zip(file.field_types()) {
//!         tracing::debug!(field = name, kind, "log file column");
//!     }
//! }
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
