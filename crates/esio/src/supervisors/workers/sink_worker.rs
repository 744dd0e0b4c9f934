//! 🗑️ SinkWorker: the unbuffered writer.
//!
//! 🎬 *[a channel fills with bundles. somewhere, a sink waits.]*
//!
//! Each bundle is a unit of work: its documents become bulk lines, the lines go through
//! this worker's own [`BulkBatcher`] (which may flush early on count or size), and the
//! bundle ends with a flush no matter how small the remainder is.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Worker, record_flush};
use crate::common::DocBatch;
use crate::progress::ProgressMetrics;
use crate::write::{BulkBatcher, BulkEntityBuilder};

#[derive(Debug)]
pub(crate) struct SinkWorker {
    id: usize,
    rx: Receiver<DocBatch>,
    builder: Arc<BulkEntityBuilder>,
    batcher: BulkBatcher,
    progress: Arc<Mutex<ProgressMetrics>>,
}

impl SinkWorker {
    pub(crate) fn new(
        id: usize,
        rx: Receiver<DocBatch>,
        builder: Arc<BulkEntityBuilder>,
        batcher: BulkBatcher,
        progress: Arc<Mutex<ProgressMetrics>>,
    ) -> Self {
        Self {
            id,
            rx,
            builder,
            batcher,
            progress,
        }
    }

    async fn write_bundle(&mut self, bundle: DocBatch) -> Result<()> {
        for doc in &bundle.docs {
            let line = self.builder.build(doc)?;
            let flushed = self.batcher.add(line).await?;
            record_flush(&self.progress, flushed);
        }
        let flushed = self.batcher.flush().await?;
        record_flush(&self.progress, flushed);
        Ok(())
    }
}

impl Worker for SinkWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 sink worker {} started draining the channel", self.id);
            while let Ok(bundle) = self.rx.recv().await {
                debug!("🪣 sink worker {} got a bundle of {} doc(s)", self.id, bundle.len());
                self.write_bundle(bundle)
                    .await
                    .with_context(|| format!("💀 sink worker {} could not write a bundle", self.id))?;
            }
            debug!("🏁 sink worker {}: channel closed, shutting down", self.id);
            Ok(())
        })
    }
}
