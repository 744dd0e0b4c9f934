//! 📖 read.rs: getting documents *out* of an index, in parallel, without the server's help.
//!
//! Two moving parts live under here:
//! - [`splitter`] turns one index into N bounded [`ReadUnit`]s (per shard on the legacy
//!   dialect, per slice on the modern ones).
//! - [`scroll`] is the [`ScrollReader`] state machine that cursors through exactly one unit.
//!
//! This file owns the knobs both of them share: [`ReadConfig`].

use serde::Deserialize;

use crate::connection::ConnectionConfig;
use crate::error::{ConnectorError, Result};

pub mod scroll;
pub mod splitter;

pub use scroll::ScrollReader;
pub use splitter::{IndexSplitter, ReadUnit, ReadUnitKind};

/// 🔍 The query sent when nobody configured one. Everything. All of it.
pub const MATCH_ALL_QUERY: &str = r#"{"query":{"match_all":{}}}"#;

/// 📏 The server refuses scroll pages bigger than this.
pub const MAX_BATCH_SIZE: u32 = 10_000;

const MIB: u64 = 1024 * 1024;

/// 📖 How to read an index.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReadConfig {
    pub connection: ConnectionConfig,
    /// 🔍 Opaque query JSON, passed through untouched (apart from the slice clause).
    #[serde(default)]
    pub query: Option<String>,
    /// 🏷️ Emit the whole hit (`_id`, `_index`, ...) instead of just `_source`.
    #[serde(default)]
    pub with_metadata: bool,
    /// ⏱️ How long the server keeps the cursor alive between pages.
    #[serde(default = "default_scroll_keepalive")]
    pub scroll_keepalive: String,
    /// 📦 Documents per page. Only the legacy dialect puts it on the wire.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// 🍕 Target size of one read unit, used to size the slice count.
    #[serde(default = "default_desired_unit_bytes")]
    pub desired_unit_bytes: u64,
    /// 🗣️ Skip the version probe and trust this major version instead.
    #[serde(default)]
    pub backend_version: Option<u32>,
}

fn default_scroll_keepalive() -> String {
    "5m".to_string()
}

fn default_batch_size() -> u32 {
    100
}

fn default_desired_unit_bytes() -> u64 {
    64 * MIB
}

impl ReadConfig {
    /// 🏗️ All defaults, just point it at a cluster.
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            query: None,
            with_metadata: false,
            scroll_keepalive: default_scroll_keepalive(),
            batch_size: default_batch_size(),
            desired_unit_bytes: default_desired_unit_bytes(),
            backend_version: None,
        }
    }

    /// 🔍 Catch the bad ideas before they reach the network.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        if let Some(ref query) = self.query {
            if query.trim().is_empty() {
                return Err(ConnectorError::Configuration(
                    "query can not be empty when set".to_string(),
                ));
            }
        }
        if self.scroll_keepalive.trim().is_empty() || self.scroll_keepalive == "0m" {
            return Err(ConnectorError::Configuration(format!(
                "scroll keepalive must be a non-zero duration, got '{}'",
                self.scroll_keepalive
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(ConnectorError::Configuration(format!(
                "batch size must be within 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.desired_unit_bytes == 0 {
            return Err(ConnectorError::Configuration(
                "desired unit bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 🔍 The configured query, or match-all.
    pub fn effective_query(&self) -> &str {
        self.query.as_deref().unwrap_or(MATCH_ALL_QUERY)
    }
}
