//! Event Monitoring Server Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Collects event monitoring data from a remote CRM platform and stores it in
//! a PostgreSQL-backed document store.
//!
//! # Overview
//!
//! - **Polling**: one recurring job per event type lists new event log files,
//!   runs each through a configurable extract, transform and load pipeline and
//!   records it in an ingestion ledger so it is never processed twice
//! - **Streaming**: one long-lived job per platform event topic stores every
//!   pushed event as it arrives
//! - **Scheduler**: bounded concurrency, heartbeats, failure bookkeeping and
//!   name-based cancellation for both kinds of job
//! - **Status API**: read-only `/health` and `/jobs` endpoints
//!
//! # Example
//!
//! ```no_run
//! use evmon_server::{config::Config, db};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     db::migrate(&pool).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod scheduler;
pub mod sfdc;
pub mod streaming;

pub use error::ApiError;
