//! 🔌 Backends: the seams where I/O plugs into the pipeline.
//!
//! 🚰 A [`Source`] pours bundles of documents; a [`BulkTransport`] swallows NDJSON bulk
//! bodies and hands back the cluster's verdict. Everything in between (building bulk
//! lines, batching, retrying) is pure-ish logic that only ever sees these two traits,
//! which is why the tests can swap in scripted fakes without spinning up a cluster.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;

use crate::common::DocBatch;

pub mod file_source;

pub use file_source::{FileSource, FileSourceConfig};

use crate::read::ScrollReader;

// ===== Source Trait and Backend Enum =====

/// 🚰 A source that produces bundles of documents.
///
/// # Contract
/// - `next_batch` returns bundles until the well runs dry, then an empty bundle.
/// - `close` releases whatever the source holds on the server side. Call it on every
///   exit path, including after `next_batch` failed.
#[async_trait]
pub trait Source: std::fmt::Debug + Send {
    /// 📦 Fetch the next bundle. Empty means done.
    async fn next_batch(&mut self) -> Result<DocBatch>;
    /// 🗑️ Release server-side and client-side resources. Never fails loudly.
    async fn close(&mut self);
}

/// 🎭 The many faces of a Source.
#[derive(Debug)]
pub enum SourceBackend {
    Scroll(Box<ScrollReader>),
    File(FileSource),
}

#[async_trait]
impl Source for SourceBackend {
    async fn next_batch(&mut self) -> Result<DocBatch> {
        match self {
            SourceBackend::Scroll(reader) => reader.next_batch().await,
            SourceBackend::File(f) => f.next_batch().await,
        }
    }

    async fn close(&mut self) {
        match self {
            SourceBackend::Scroll(reader) => reader.close().await,
            SourceBackend::File(f) => f.close().await,
        }
    }
}

// ===== Bulk transport =====

/// 🕳️ Where bulk bodies go to be judged.
///
/// Returns the raw response text of a 2xx reply. Transport failures and non-2xx replies
/// come back as [`crate::error::ConnectorError::Connection`], which is what the retry
/// executor keys on.
#[async_trait]
pub trait BulkTransport: std::fmt::Debug + Send + Sync {
    async fn send_bulk(&self, payload: &str) -> crate::error::Result<String>;
}
