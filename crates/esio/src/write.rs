//! ✍️ write.rs: getting documents *into* an index, in bulk, without losing any on the way.
//!
//! The write path, one hop per submodule:
//!
//! ```text
//!   document ─▶ entity (BulkEntityBuilder) ─▶ batcher (BulkBatcher) ─▶ retry (RetryExecutor)
//!                    ▲                              ▲                          │
//!                 extract                         keyed                     response
//!          (ValueExtractor / FlagExtractor)  (shard keys + timers)   (check_for_errors)
//! ```
//!
//! Everything here is configured through [`WriteConfig`], which is what the `sink_config`
//! table of the TOML deserialises into.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::connection::ConnectionConfig;
use crate::dialect::Dialect;
use crate::error::{ConnectorError, Result};

pub mod batcher;
pub mod entity;
pub mod extract;
pub mod keyed;
pub mod response;
pub mod retry;

pub use batcher::{BulkBatcher, FlushOutcome};
pub use entity::{BulkEntityBuilder, BulkLine, BulkOp, DocumentAddress};
pub use extract::{FieldPath, FlagExtractor, ValueExtractor};
pub use keyed::{KeyedGroup, ShardAssigner};
pub use response::{VERSION_CONFLICT_ERROR, check_for_errors};
pub use retry::{RetryExecutor, RetryPolicy, RetryPredicate, ThrottledItemPredicate};

const MIB: u64 = 1024 * 1024;

/// ✍️ Everything the sink side needs.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WriteConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub documents: DocToBulkConfig,
    #[serde(default)]
    pub bulk: BulkConfig,
}

impl WriteConfig {
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.documents.validate()?;
        self.bulk.validate()
    }
}

/// 🏗️ How one document becomes one bulk line.
///
/// Field paths are JSON pointers (`/meta/id`) or bare top-level keys (`id`).
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct DocToBulkConfig {
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(default)]
    pub index_field: Option<String>,
    #[serde(default)]
    pub type_field: Option<String>,
    #[serde(default)]
    pub routing_field: Option<String>,
    #[serde(default)]
    pub version_field: Option<String>,
    /// 🔢 one of `internal`, `external`, `external_gt`, `external_gte`
    #[serde(default)]
    pub version_type: Option<String>,
    /// 🗑️ boolean field that turns the document into a delete
    #[serde(default)]
    pub delete_flag_field: Option<String>,
    /// 🩹 send `update` with `doc_as_upsert` instead of `index`
    #[serde(default)]
    pub use_partial_update: bool,
    /// 📜 script source for a scripted upsert; the document rides along as `params`
    #[serde(default)]
    pub upsert_script: Option<String>,
    #[serde(default)]
    pub backend_version: Option<u32>,
}

impl DocToBulkConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(major) = self.backend_version {
            Dialect::for_configured_major(major)?;
        }
        entity::validate_version_type(self.version_type.as_deref())?;
        if self.delete_flag_field.is_some() && self.id_field.is_none() {
            return Err(ConnectorError::Configuration(
                "a delete flag requires an id field, deletes need to know what to delete"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// 🧮 How shard keys are picked in buffered mode.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShardAssignment {
    #[default]
    RoundRobin,
    /// #️⃣ by action header, so one document id always lands on the same key
    Hash,
}

/// 🔄 Retry knobs as they appear in the config file.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub max_duration_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
}

fn default_initial_backoff_ms() -> u64 {
    5_000
}

impl RetryConfig {
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        Ok(RetryPolicy::new(self.max_attempts, Duration::from_secs(self.max_duration_secs))?
            .with_initial_backoff(Duration::from_millis(self.initial_backoff_ms)))
    }
}

/// 📦 Batching, retrying and error suppression for the bulk requests.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BulkConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub ignore_version_conflicts: bool,
    #[serde(default)]
    pub allowed_response_errors: Vec<String>,
    #[serde(default)]
    pub use_stateful_batches: bool,
    #[serde(default)]
    pub max_buffering_duration_ms: Option<u64>,
    #[serde(default = "default_max_parallel_requests")]
    pub max_parallel_requests: usize,
    #[serde(default)]
    pub shard_assignment: ShardAssignment,
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_batch_size_bytes() -> u64 {
    5 * MIB
}

fn default_max_parallel_requests() -> usize {
    1
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            max_batch_size_bytes: default_max_batch_size_bytes(),
            retry: None,
            ignore_version_conflicts: false,
            allowed_response_errors: Vec::new(),
            use_stateful_batches: false,
            max_buffering_duration_ms: None,
            max_parallel_requests: default_max_parallel_requests(),
            shard_assignment: ShardAssignment::default(),
        }
    }
}

impl BulkConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(ConnectorError::Configuration(
                "max batch size must be > 0".to_string(),
            ));
        }
        if self.max_batch_size_bytes == 0 {
            return Err(ConnectorError::Configuration(
                "max batch size bytes must be > 0".to_string(),
            ));
        }
        if self.max_parallel_requests == 0 {
            return Err(ConnectorError::Configuration(
                "max parallel requests must be > 0".to_string(),
            ));
        }
        if self.max_buffering_duration_ms == Some(0) {
            return Err(ConnectorError::Configuration(
                "max buffering duration must be > 0 when set".to_string(),
            ));
        }
        if let Some(ref retry) = self.retry {
            retry.to_policy()?;
        }
        Ok(())
    }

    /// 🧠 Buffered mode is on when asked for, or implied by a buffering duration.
    pub fn is_stateful(&self) -> bool {
        self.use_stateful_batches || self.max_buffering_duration_ms.is_some()
    }

    /// ⚠️ Buffered mode is on only because a buffering duration dragged it along.
    pub fn buffering_implies_stateful(&self) -> bool {
        self.max_buffering_duration_ms.is_some() && !self.use_stateful_batches
    }

    pub fn max_buffering_duration(&self) -> Option<Duration> {
        self.max_buffering_duration_ms.map(Duration::from_millis)
    }

    /// 🙈 Error types that must not fail a flush.
    pub fn allowed_error_set(&self) -> HashSet<String> {
        let mut allowed: HashSet<String> = self.allowed_response_errors.iter().cloned().collect();
        if self.ignore_version_conflicts {
            allowed.insert(VERSION_CONFLICT_ERROR.to_string());
        }
        allowed
    }

    pub fn retry_policy(&self) -> Result<Option<RetryPolicy>> {
        self.retry.as_ref().map(RetryConfig::to_policy).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_ignoring_conflicts_is_just_a_set_insert() {
        let config = BulkConfig {
            ignore_version_conflicts: true,
            allowed_response_errors: vec!["mapper_parsing_exception".to_string()],
            ..BulkConfig::default()
        };
        let allowed = config.allowed_error_set();
        assert!(allowed.contains(VERSION_CONFLICT_ERROR));
        assert!(allowed.contains("mapper_parsing_exception"));
        assert_eq!(allowed.len(), 2);
    }

    #[test]
    fn the_one_where_a_buffering_duration_drags_stateful_along() {
        let config = BulkConfig {
            max_buffering_duration_ms: Some(250),
            ..BulkConfig::default()
        };
        assert!(config.is_stateful());
        assert!(!BulkConfig::default().is_stateful());
    }

    #[test]
    fn the_one_where_only_an_implied_switch_is_worth_a_warning() {
        let implied = BulkConfig {
            max_buffering_duration_ms: Some(250),
            ..BulkConfig::default()
        };
        let explicit = BulkConfig {
            use_stateful_batches: true,
            max_buffering_duration_ms: Some(250),
            ..BulkConfig::default()
        };
        assert!(implied.buffering_implies_stateful());
        assert!(!explicit.buffering_implies_stateful());
        assert!(!BulkConfig::default().buffering_implies_stateful());
        // 🔁 asking twice changes nothing
        assert_eq!(implied.is_stateful(), implied.is_stateful());
    }

    #[test]
    fn the_one_where_zero_is_never_a_valid_limit() {
        for broken in [
            BulkConfig { max_batch_size: 0, ..BulkConfig::default() },
            BulkConfig { max_batch_size_bytes: 0, ..BulkConfig::default() },
            BulkConfig { max_parallel_requests: 0, ..BulkConfig::default() },
            BulkConfig {
                retry: Some(RetryConfig { max_attempts: 0, max_duration_secs: 10, initial_backoff_ms: 5 }),
                ..BulkConfig::default()
            },
            BulkConfig {
                retry: Some(RetryConfig { max_attempts: 3, max_duration_secs: 0, initial_backoff_ms: 5 }),
                ..BulkConfig::default()
            },
        ] {
            assert!(matches!(broken.validate(), Err(ConnectorError::Configuration(_))));
        }
    }

    #[test]
    fn the_one_where_delete_without_an_id_is_caught_at_the_door() {
        let config = DocToBulkConfig {
            delete_flag_field: Some("deleted".to_string()),
            ..DocToBulkConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConnectorError::Configuration(_))));

        let config = DocToBulkConfig {
            backend_version: Some(8),
            ..DocToBulkConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConnectorError::Configuration(_))));
    }
}
