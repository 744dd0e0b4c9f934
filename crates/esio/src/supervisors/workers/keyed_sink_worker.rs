//! ⏰ KeyedSinkWorker: buffered mode's writer, one per shard key.
//!
//! Lines wait in a [`KeyedGroup`] until there are `max_batch_size` of them or the oldest
//! has waited `max_buffering_duration`, whichever comes first. Then the group goes
//! through this worker's [`BulkBatcher`] and out the door. One worker per key, one
//! request in flight per worker: the parallelism bound is the number of keys.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Worker, record_flush};
use crate::progress::ProgressMetrics;
use crate::write::{BulkBatcher, BulkLine, KeyedGroup};

#[derive(Debug)]
pub(crate) struct KeyedSinkWorker {
    key: usize,
    rx: Receiver<BulkLine>,
    group: KeyedGroup,
    batcher: BulkBatcher,
    progress: Arc<Mutex<ProgressMetrics>>,
}

/// ⏳ Sleep until the deadline, or forever if there isn't one.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl KeyedSinkWorker {
    pub(crate) fn new(
        key: usize,
        rx: Receiver<BulkLine>,
        group: KeyedGroup,
        batcher: BulkBatcher,
        progress: Arc<Mutex<ProgressMetrics>>,
    ) -> Self {
        Self {
            key,
            rx,
            group,
            batcher,
            progress,
        }
    }

    async fn write_group(&mut self, lines: Vec<BulkLine>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        trace!("⏰ shard key {} flushing a group of {}", self.key, lines.len());
        for line in lines {
            let flushed = self.batcher.add(line).await?;
            record_flush(&self.progress, flushed);
        }
        let flushed = self.batcher.flush().await?;
        record_flush(&self.progress, flushed);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        loop {
            let deadline = self.group.deadline();
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok(line) => {
                        if let Some(full) = self.group.push_at(line, Instant::now()) {
                            self.write_group(full).await?;
                        }
                    }
                    Err(_) => {
                        let rest = self.group.drain();
                        return self.write_group(rest).await;
                    }
                },
                _ = until(deadline) => {
                    if let Some(expired) = self.group.take_expired(Instant::now()) {
                        self.write_group(expired).await?;
                    }
                }
            }
        }
    }
}

impl Worker for KeyedSinkWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("⏰ keyed sink worker {} started", self.key);
            self.run()
                .await
                .with_context(|| format!("💀 keyed sink worker {} could not write", self.key))?;
            debug!("🏁 keyed sink worker {}: no more lines, shutting down", self.key);
            Ok(())
        })
    }
}
