//! 🚦 DispatchWorker: buffered mode's traffic cop.
//!
//! Turns every document of every bundle into a bulk line (once, here, so extraction
//! errors surface before anything is queued) and sends it to the shard key the
//! [`ShardAssigner`] picks. When the bundle channel closes, dropping the per-key senders
//! tells every keyed worker to flush what it has and go home.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::debug;

use super::Worker;
use crate::common::DocBatch;
use crate::write::{BulkEntityBuilder, BulkLine, ShardAssigner};

#[derive(Debug)]
pub(crate) struct DispatchWorker {
    rx: Receiver<DocBatch>,
    builder: Arc<BulkEntityBuilder>,
    assigner: ShardAssigner,
    shard_txs: Vec<Sender<BulkLine>>,
}

impl DispatchWorker {
    pub(crate) fn new(
        rx: Receiver<DocBatch>,
        builder: Arc<BulkEntityBuilder>,
        assigner: ShardAssigner,
        shard_txs: Vec<Sender<BulkLine>>,
    ) -> Self {
        Self {
            rx,
            builder,
            assigner,
            shard_txs,
        }
    }

    async fn dispatch(&mut self, bundle: DocBatch) -> Result<()> {
        for doc in &bundle.docs {
            let line = self.builder.build(doc)?;
            let key = self.assigner.assign(&line);
            let Some(tx) = self.shard_txs.get(key) else {
                anyhow::bail!("💀 shard key {key} has no worker behind it");
            };
            tx.send(line)
                .await
                .with_context(|| format!("💀 the writer for shard key {key} is gone"))?;
        }
        Ok(())
    }
}

impl Worker for DispatchWorker {
    fn start(mut self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!(
                "🚦 dispatcher started, {} shard key(s)",
                self.assigner.shards()
            );
            while let Ok(bundle) = self.rx.recv().await {
                self.dispatch(bundle).await?;
            }
            debug!("🏁 dispatcher: bundle channel closed, releasing the shard keys");
            Ok(())
        })
    }
}
