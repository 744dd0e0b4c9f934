//! 📂 FileSource: NDJSON on disk, one document per line, bundled up for the write path.
//!
//! Lets the bulk side run without a source cluster: point it at a file, watch it go.
//! Blank lines are skipped. Everything else is trusted to be a JSON document; the bulk
//! builder will complain loudly if it isn't.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{self, AsyncBufReadExt},
};
use tracing::{debug, trace};

use crate::backends::Source;
use crate::common::DocBatch;

// 📂 FileSourceConfig lives next to the FileSource that reads it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FileSourceConfig {
    pub file_name: String,
    /// 📦 Documents per bundle.
    #[serde(default = "default_docs_per_batch")]
    pub docs_per_batch: usize,
}

fn default_docs_per_batch() -> usize {
    1000
}

/// 📂 Reads a file line by line and hands out bundles of `docs_per_batch` documents.
pub struct FileSource {
    lines: io::Lines<io::BufReader<File>>,
    config: FileSourceConfig,
    /// 📏 size on disk, for the progress bar. 0 = unknown.
    pub(crate) file_size: u64,
}

// 🐛 the line reader is noise, so we print the config and call it a day
impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("config", &self.config)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl FileSource {
    /// 🚀 Open the file. If it isn't there, anyhow will say so with feeling.
    pub async fn new(config: FileSourceConfig) -> Result<Self> {
        if config.docs_per_batch == 0 {
            anyhow::bail!("💀 docs_per_batch must be > 0, a bundle of nothing is just an empty promise");
        }
        let file_handle = File::open(&config.file_name).await.context(format!(
            "💀 The door to '{}' would not budge. Check the path, check the permissions, check the cwd.",
            config.file_name
        ))?;
        // 📏 metadata failure means we fly blind on percent-done. not fatal.
        let file_size = file_handle.metadata().await.map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            lines: io::BufReader::new(file_handle).lines(),
            config,
            file_size,
        })
    }
}

#[async_trait]
impl Source for FileSource {
    async fn next_batch(&mut self) -> Result<DocBatch> {
        let mut docs = Vec::with_capacity(self.config.docs_per_batch);
        while docs.len() < self.config.docs_per_batch {
            let line = self
                .lines
                .next_line()
                .await
                .context(format!("💀 Reading '{}' failed mid-line", self.config.file_name))?;
            let Some(line) = line else { break };
            let trimmed = line.trim_end_matches('\r');
            if !trimmed.trim().is_empty() {
                docs.push(trimmed.to_string());
            }
        }
        trace!("📖 hauled {} docs out of '{}'", docs.len(), self.config.file_name);
        Ok(DocBatch::new(docs))
    }

    async fn close(&mut self) {
        debug!("🗑️ file source '{}' closed", self.config.file_name);
    }
}
