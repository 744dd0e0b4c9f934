//! 📡 esio: scroll documents out of one Elasticsearch cluster, bulk them into another.
//!
//! 🎬 *[a cursor opens. somewhere, a 429 clears its throat.]*
//!
//! 🧱 The pieces, bottom-up:
//! - [`connection`]: the HTTP client and the one place requests are sent
//! - [`dialect`]: what the server's major version changes about the wire
//! - [`read`]: split an index into read units, scroll each one out
//! - [`write`]: documents into bulk lines, lines into batches, batches out with retries
//! - [`app_config`]: one TOML file plus `ESIO_*` env vars becomes an [`app_config::AppConfig`]
//!
//! [`run`] strings them together. The components are public too, for anyone who would
//! rather hold the pieces than the whole pipe.

pub mod app_config;
pub mod backends;
pub mod common;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod progress;
pub mod read;
mod supervisors;
pub mod write;

use anyhow::{Context, Result};

use crate::app_config::AppConfig;
use crate::supervisors::Supervisor;

pub use crate::supervisors::RunSummary;

/// 🚀 Run one copy, start to finish.
///
/// Validates the config, probes both clusters, splits the source, then streams until
/// every source is drained and every bulk request has landed. The first failure stops
/// the run and comes back here with its context attached.
pub async fn run(app_config: AppConfig) -> Result<RunSummary> {
    Supervisor::new(app_config)
        .run()
        .await
        .context("💀 the run did not finish")
}
