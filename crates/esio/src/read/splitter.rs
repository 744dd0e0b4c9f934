//! 🍕 splitter.rs: cutting an index into pieces that can be read at the same time.
//!
//! Legacy clusters can't parallelise inside a shard, so we get one unit per shard and
//! that's the end of the negotiation. Modern clusters support sliced scrolls, so we
//! estimate the index size, divide by the size we'd like each unit to be, and ask for
//! that many slices (the server caps it at 1024, so do we).
//!
//! ⚠️ The filtered size estimate assumes every document weighs the same. They don't.
//! It's an estimate. It says so in the name.

use reqwest::Method;
use serde_json::Value;
use tracing::debug;

use crate::connection::Connection;
use crate::dialect::{Dialect, SplitStrategy};
use crate::error::{ConnectorError, Result};
use crate::read::ReadConfig;

/// 🍕 The server-side ceiling on slices per scroll.
pub const MAX_SLICES: u32 = 1024;

/// 🧩 What part of the index a unit covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadUnitKind {
    /// 🌍 the whole index, no split
    Whole,
    /// 🧩 one primary shard, addressed through `preference=_shards:<id>`
    Shard { preference: String },
    /// 🍕 slice `id` of `max`
    Slice { id: u32, max: u32 },
}

/// 📦 One bounded chunk of work for one [`super::ScrollReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadUnit {
    pub kind: ReadUnitKind,
    pub estimated_bytes: Option<u64>,
}

impl ReadUnit {
    pub fn whole() -> Self {
        Self {
            kind: ReadUnitKind::Whole,
            estimated_bytes: None,
        }
    }

    pub fn shard(preference: impl Into<String>) -> Self {
        Self {
            kind: ReadUnitKind::Shard {
                preference: preference.into(),
            },
            estimated_bytes: None,
        }
    }

    pub fn slice(id: u32, max: u32, estimated_bytes: u64) -> Self {
        Self {
            kind: ReadUnitKind::Slice { id, max },
            estimated_bytes: Some(estimated_bytes),
        }
    }

    /// 🍕 `(id, max)` when a slice clause must go on the wire. A slice of one is no slice at all.
    pub fn slice_clause(&self) -> Option<(u32, u32)> {
        match self.kind {
            ReadUnitKind::Slice { id, max } if max > 1 => Some((id, max)),
            _ => None,
        }
    }

    /// 🧩 The shard id to pin the search to, if any.
    pub fn shard_preference(&self) -> Option<&str> {
        match self.kind {
            ReadUnitKind::Shard { ref preference } => Some(preference),
            _ => None,
        }
    }
}

/// 🔪 Computes parallel read units for one index.
#[derive(Debug)]
pub struct IndexSplitter<'a> {
    connection: &'a Connection,
    config: &'a ReadConfig,
    dialect: Dialect,
}

impl<'a> IndexSplitter<'a> {
    pub fn new(connection: &'a Connection, config: &'a ReadConfig, dialect: Dialect) -> Self {
        Self {
            connection,
            config,
            dialect,
        }
    }

    /// 🔪 Split the index into read units of roughly `desired_unit_bytes` each.
    pub async fn split(&self, desired_unit_bytes: u64) -> Result<Vec<ReadUnit>> {
        if desired_unit_bytes == 0 {
            return Err(ConnectorError::Configuration(
                "desired unit bytes must be > 0".to_string(),
            ));
        }
        let index = &self.config.connection.index;
        let units = match self.dialect.split_strategy {
            SplitStrategy::PerShard => {
                let stats = self.stats(true).await?;
                shard_units(&stats, index)?
            }
            SplitStrategy::PerSlice => {
                let estimated = self.estimate_size_bytes().await?;
                slice_units(estimated, desired_unit_bytes)
            }
        };
        debug!(
            "🍕 index '{}' split into {} unit(s) (dialect {})",
            index,
            units.len(),
            self.dialect.major
        );
        Ok(units)
    }

    /// 📏 Bytes this read is expected to pull. Never zero, so nobody downstream divides by it.
    pub async fn estimate_size_bytes(&self) -> Result<u64> {
        let stats = self.stats(false).await?;
        let index = &self.config.connection.index;
        let (index_bytes, total_count) = primaries_totals(&stats, index)?;
        debug!("📏 '{index}' holds {index_bytes} bytes of primaries");

        let query = match self.config.query {
            Some(ref query) if !query.trim().is_empty() => query,
            _ => return Ok(index_bytes),
        };

        if total_count == 0 {
            return Ok(1);
        }

        let count_path =
            self.dialect
                .index_path(index, &self.config.connection.doc_type, "_count");
        let count_response = self
            .connection
            .perform_json(Method::GET, &count_path, &[], Some(query))
            .await?;
        let filtered_count = count_response
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ConnectorError::MalformedResponse(format!(
                    "{count_path} answered without a count: {count_response}"
                ))
            })?;
        debug!("📏 query matches {filtered_count} of {total_count} document(s)");
        Ok(filtered_estimate(index_bytes, total_count, filtered_count))
    }

    async fn stats(&self, shard_level: bool) -> Result<Value> {
        let path = format!("/{}/_stats", self.config.connection.index);
        let params = if shard_level {
            vec![("level", "shards".to_string())]
        } else {
            Vec::new()
        };
        self.connection
            .perform_json(Method::GET, &path, &params, None)
            .await
    }
}

fn index_stats<'v>(stats: &'v Value, index: &str) -> Result<&'v Value> {
    stats
        .get("indices")
        .and_then(|indices| indices.get(index))
        .ok_or_else(|| {
            ConnectorError::MalformedResponse(format!("stats have no entry for index '{index}'"))
        })
}

/// 📏 `(store bytes, doc count)` of the primaries, summed over every entry under
/// `indices`. An alias or a wildcard answers with one entry per backing index.
pub fn primaries_totals(stats: &Value, index: &str) -> Result<(u64, u64)> {
    let entries = stats
        .get("indices")
        .and_then(Value::as_object)
        .filter(|entries| !entries.is_empty())
        .ok_or_else(|| {
            ConnectorError::MalformedResponse(format!("stats have no entry for '{index}'"))
        })?;
    let mut bytes = 0u64;
    let mut docs = 0u64;
    for (name, entry) in entries {
        let primaries = entry.get("primaries").ok_or_else(|| {
            ConnectorError::MalformedResponse(format!(
                "stats for index '{name}' carry no primaries section"
            ))
        })?;
        let field = |pointer: &str| primaries.pointer(pointer).and_then(Value::as_u64).unwrap_or(0);
        bytes = bytes.saturating_add(field("/store/size_in_bytes"));
        docs = docs.saturating_add(field("/docs/count"));
    }
    Ok((bytes, docs))
}

/// 🧩 One unit per key of `indices.{index}.shards`.
pub fn shard_units(stats: &Value, index: &str) -> Result<Vec<ReadUnit>> {
    let shards = index_stats(stats, index)?
        .get("shards")
        .and_then(Value::as_object);
    let units: Vec<ReadUnit> = shards
        .map(|shards| shards.keys().map(ReadUnit::shard).collect())
        .unwrap_or_default();
    if units.is_empty() {
        return Err(ConnectorError::NoShardsFound {
            index: index.to_string(),
        });
    }
    Ok(units)
}

/// 🍕 `ceil(estimated / desired)` slices, at least one, at most [`MAX_SLICES`].
pub fn slice_units(estimated_bytes: u64, desired_unit_bytes: u64) -> Vec<ReadUnit> {
    let wanted = estimated_bytes.div_ceil(desired_unit_bytes.max(1));
    let count = wanted.clamp(1, u64::from(MAX_SLICES)) as u32;
    let per_unit = estimated_bytes / u64::from(count);
    (0..count)
        .map(|id| ReadUnit::slice(id, count, per_unit))
        .collect()
}

/// 📏 `(index_bytes / total_count) * filtered_count`, floored at one byte.
fn filtered_estimate(index_bytes: u64, total_count: u64, filtered_count: u64) -> u64 {
    if total_count == 0 || filtered_count == 0 {
        return 1;
    }
    (index_bytes / total_count).saturating_mul(filtered_count)
}
