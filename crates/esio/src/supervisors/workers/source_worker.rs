//! 📖 SourceWorker takes a source off the work queue, pours it into the bundle channel,
//! closes it, takes the next one. Repeat until the queue is empty.
//!
//! 🗑️ `close()` runs whether the draining worked or not. Scroll cursors are a server
//! resource and the server would like them back.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::Worker;
use crate::backends::{Source, SourceBackend};
use crate::common::DocBatch;
use crate::progress::ProgressMetrics;

#[derive(Debug)]
pub(crate) struct SourceWorker {
    id: usize,
    work: Receiver<SourceBackend>,
    tx: Sender<DocBatch>,
    progress: Arc<Mutex<ProgressMetrics>>,
}

impl SourceWorker {
    pub(crate) fn new(
        id: usize,
        work: Receiver<SourceBackend>,
        tx: Sender<DocBatch>,
        progress: Arc<Mutex<ProgressMetrics>>,
    ) -> Self {
        Self {
            id,
            work,
            tx,
            progress,
        }
    }

    async fn drain(&self, source: &mut SourceBackend) -> Result<()> {
        loop {
            let batch = source.next_batch().await?;
            if batch.is_empty() {
                return Ok(());
            }
            trace!("📦 source worker {} read {} doc(s)", self.id, batch.len());
            if let Ok(mut progress) = self.progress.lock() {
                progress.record_read(batch.total_bytes() as u64, batch.len() as u64);
            }
            self.tx
                .send(batch)
                .await
                .context("💀 the sink side hung up while documents were still coming")?;
        }
    }
}

impl Worker for SourceWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📖 source worker {} started", self.id);
            while let Ok(mut source) = self.work.recv().await {
                let drained = self.drain(&mut source).await;
                source.close().await;
                drained.with_context(|| format!("💀 source worker {} failed", self.id))?;
            }
            debug!("🏁 source worker {}: work queue empty, shutting down", self.id);
            Ok(())
        })
    }
}
