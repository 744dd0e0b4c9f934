//! 💀 error.rs: every way a document can fail to get where it's going, with a name tag.
//!
//! The glue code (supervisor, workers, CLI) lives on `anyhow` and context chains, because
//! at 3am you want the story, not the type. The components underneath return
//! [`ConnectorError`] so callers can tell a throttled cluster from a typo in the config
//! without grepping error strings like a raccoon in a dumpster. 🦝
//!
//! `ConnectorError` is a real `std::error::Error`, so `?` lifts it into `anyhow` for free
//! and `err.downcast_ref::<ConnectorError>()` gets it back out again.

/// 🏷️ The connector's failure taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// 🔧 Invalid combination of settings. Raised before any request leaves the building.
    #[error("💀 Configuration error: {0}")]
    Configuration(String),

    /// 📡 The cluster speaks a dialect we never learned.
    #[error(
        "💀 The cluster reports version '{found}', but only the 2.x, 5.x, 6.x and 7.x dialects are spoken here"
    )]
    UnsupportedVersion { found: String },

    /// 🔌 Transport failure, or a non-2xx reply, with nobody configured to try again.
    #[error("💀 Connection error: {0}")]
    Connection(String),

    /// 🗺️ Legacy split found an index with zero shards. An index of nothing.
    #[error("💀 No shard found for index '{index}', nothing to split, nothing to read")]
    NoShardsFound { index: String },

    /// 🔄 The backoff loop ran out of attempts or time.
    #[error("💀 Error writing to the cluster after {attempts} attempt(s). No more attempts allowed")]
    RetryExhausted { attempts: u32 },

    /// 📦 One or more documents in a bulk request failed with a non-allowed error type.
    #[error("{0}")]
    PartialBulkFailure(String),

    /// 🔍 A per-document extractor could not produce a value.
    #[error("💀 Could not extract document metadata: {0}")]
    Extraction(String),

    /// 🤷 The server answered, but not in any shape we recognise.
    #[error("💀 Malformed response from the cluster: {0}")]
    MalformedResponse(String),
}

/// 🎯 Component-level result. The glue code uses `anyhow::Result` instead.
pub type Result<T> = std::result::Result<T, ConnectorError>;

impl From<serde_json::Error> for ConnectorError {
    fn from(e: serde_json::Error) -> Self {
        ConnectorError::MalformedResponse(e.to_string())
    }
}

impl ConnectorError {
    /// 🔄 Is this the kind of failure a retry policy is allowed to swallow?
    pub fn is_transport(&self) -> bool {
        matches!(self, ConnectorError::Connection(_))
    }
}
