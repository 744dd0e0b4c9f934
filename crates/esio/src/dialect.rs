//! 🗣️ dialect.rs: which flavour of the protocol does this cluster speak?
//!
//! Major versions 2, 5, 6 and 7 each rename a field here, drop a path segment there, and
//! disagree on how a scan can be parallelised. Instead of sprinkling `if version == 2`
//! over the codebase like parmesan, every difference lives in one table ([`DIALECTS`])
//! and gets resolved once per connector instance.
//!
//! The probe ([`probe_backend_version`]) is stateless: one `GET /`, one parse, done.
//! Caching the answer is the caller's job.

use reqwest::Method;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{ConnectorError, Result};

/// 🗺️ How a dialect lets us parallelise a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitStrategy {
    /// 🧩 one reader per primary shard, no intra-shard parallelism
    PerShard,
    /// 🍕 sliced scroll, reader count sized from the byte estimate
    PerSlice,
}

/// 📜 One row of the dialect table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub major: u8,
    /// 🔄 name of the retry-on-conflict field in a bulk action header
    pub retry_on_conflict_field: &'static str,
    pub split_strategy: SplitStrategy,
    /// 🏷️ whether `/{index}/{type}/_search` (true) or `/{index}/_search` (false)
    pub type_in_path: bool,
}

/// 📜 The whole table. Four rows. Add a row, gain a dialect.
pub const DIALECTS: [Dialect; 4] = [
    Dialect {
        major: 2,
        retry_on_conflict_field: "_retry_on_conflict",
        split_strategy: SplitStrategy::PerShard,
        type_in_path: true,
    },
    Dialect {
        major: 5,
        retry_on_conflict_field: "_retry_on_conflict",
        split_strategy: SplitStrategy::PerSlice,
        type_in_path: true,
    },
    Dialect {
        major: 6,
        retry_on_conflict_field: "retry_on_conflict",
        split_strategy: SplitStrategy::PerSlice,
        type_in_path: true,
    },
    Dialect {
        major: 7,
        retry_on_conflict_field: "retry_on_conflict",
        split_strategy: SplitStrategy::PerSlice,
        type_in_path: false,
    },
];

impl Dialect {
    /// 🔍 Look up a major version. Anything off the table is `UnsupportedVersion`.
    pub fn for_major(major: u32) -> Result<Dialect> {
        DIALECTS
            .iter()
            .find(|d| u32::from(d.major) == major)
            .copied()
            .ok_or_else(|| ConnectorError::UnsupportedVersion {
                found: major.to_string(),
            })
    }

    /// 🔍 Like [`Dialect::for_major`], but a miss is a configuration mistake, not a cluster surprise.
    pub fn for_configured_major(major: u32) -> Result<Dialect> {
        Self::for_major(major).map_err(|_| {
            ConnectorError::Configuration(format!(
                "backend version may only be one of 2, 5, 6, 7 but was {major}"
            ))
        })
    }

    /// 📡 `/{index}[/{type}]/{endpoint}` for this dialect.
    pub fn index_path(&self, index: &str, doc_type: &str, endpoint: &str) -> String {
        if self.type_in_path {
            format!("/{index}/{doc_type}/{endpoint}")
        } else {
            format!("/{index}/{endpoint}")
        }
    }
}

/// 🔢 Major version out of a dotted version string. `"7.10.2"` → 7, `"2.4.6-SNAPSHOT"` → 2.
pub fn parse_major_version(number: &str) -> Result<u32> {
    let major = number.split('.').next().unwrap_or_default();
    major.trim().parse::<u32>().map_err(|_| ConnectorError::UnsupportedVersion {
        found: number.to_string(),
    })
}

/// 📡 Ask the cluster who it is. Returns the major version, already checked against the table.
pub async fn probe_backend_version(connection: &Connection) -> Result<u32> {
    let root = connection.perform_json(Method::GET, "/", &[], None).await?;
    let number = root
        .pointer("/version/number")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            ConnectorError::MalformedResponse(format!(
                "GET / has no version.number in it: {root}"
            ))
        })?;
    let major = parse_major_version(number)?;
    Dialect::for_major(major)?;
    debug!("🗣️ cluster speaks dialect {major} (version {number})");
    Ok(major)
}

/// 🎯 Probe, unless the caller already knows. A configured override is validated, never trusted blindly.
pub async fn resolve_dialect(connection: &Connection, configured: Option<u32>) -> Result<Dialect> {
    match configured {
        Some(major) => Dialect::for_configured_major(major),
        None => Dialect::for_major(probe_backend_version(connection).await?),
    }
}
