//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where scroll cursors expire and bulk queues overflow..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 The Supervisor wires the run together:
//!
//! ```text
//!   sources ──▶ SourceWorker × source_parallelism ──▶ bundle channel ──┬──▶ SinkWorker × sink_parallelism
//!                                                                      │        (unbuffered)
//!                                                                      └──▶ DispatchWorker ──▶ KeyedSinkWorker × max_parallel_requests
//!                                                                               (buffered / keyed)
//! ```
//!
//! Everything that can be checked up front (config, dialects, builder settings, the
//! split) is checked before a single worker is spawned.
//!
//! ⚠️ The workers stay private. Like Fight Club, but for async tasks.

mod workers;

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app_config::{AppConfig, SourceConfig};
use crate::backends::{BulkTransport, FileSource, SourceBackend};
use crate::common::DocBatch;
use crate::connection::Connection;
use crate::dialect::resolve_dialect;
use crate::progress::ProgressMetrics;
use crate::read::{IndexSplitter, ScrollReader};
use crate::write::{BulkBatcher, BulkEntityBuilder, KeyedGroup, ShardAssigner};
use workers::{DispatchWorker, KeyedSinkWorker, SinkWorker, SourceWorker, Worker};

/// 🧾 What a finished run moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub docs_read: u64,
    pub docs_written: u64,
}

/// 🚰 The sources to drain, and how many bytes they are expected to yield.
struct PreparedSources {
    label: String,
    sources: Vec<SourceBackend>,
    estimated_bytes: u64,
}

/// ✍️ Everything the sink stage shares between workers.
struct PreparedSink {
    builder: Arc<BulkEntityBuilder>,
    transport: Arc<dyn BulkTransport>,
}

pub(crate) struct Supervisor {
    app_config: AppConfig,
}

impl Supervisor {
    pub(crate) fn new(app_config: AppConfig) -> Self {
        Self { app_config }
    }

    /// 🧵 Prepare, spawn, wait. The first worker error wins.
    pub(crate) async fn run(self) -> Result<RunSummary> {
        self.app_config.validate()?;

        let sink = self
            .prepare_sink()
            .await
            .context("💀 the sink cluster could not be prepared")?;
        let sources = self
            .prepare_sources()
            .await
            .context("💀 the source could not be prepared")?;

        let runtime = &self.app_config.runtime;
        let progress = Arc::new(Mutex::new(if runtime.show_progress {
            ProgressMetrics::new(sources.label.clone(), sources.estimated_bytes)
        } else {
            ProgressMetrics::hidden(sources.label.clone(), sources.estimated_bytes)
        }));
        info!(
            "🚀 starting: {} source(s), ~{} byte(s) to read",
            sources.sources.len(),
            sources.estimated_bytes
        );

        let (mut workers, bundles) = self.start_source_stage(sources.sources, &progress);
        let bundle_gate = bundles.clone();
        workers.extend(self.start_sink_stage(bundles, sink, &progress)?);

        let outcome = join_workers(workers, &bundle_gate).await;
        let summary = match progress.lock() {
            Ok(p) => {
                p.finish();
                RunSummary {
                    docs_read: p.docs_read(),
                    docs_written: p.docs_written(),
                }
            }
            Err(_) => RunSummary {
                docs_read: 0,
                docs_written: 0,
            },
        };
        outcome?;
        info!(
            "✅ done: {} doc(s) read, {} doc(s) written",
            summary.docs_read, summary.docs_written
        );
        Ok(summary)
    }

    async fn prepare_sink(&self) -> Result<PreparedSink> {
        let write = &self.app_config.sink_config;
        let connection = Connection::open(&write.connection).await?;
        let dialect = resolve_dialect(&connection, write.documents.backend_version).await?;
        debug!("✍️ sink speaks dialect {}", dialect.major);
        let connection = connection.with_bulk_path(dialect.index_path(
            &write.connection.index,
            &write.connection.doc_type,
            "_bulk",
        ));
        let builder = BulkEntityBuilder::from_config(&write.documents, dialect)?;
        // 🧪 fail on bad retry settings now rather than inside a worker
        write.bulk.retry_policy()?;
        Ok(PreparedSink {
            builder: Arc::new(builder),
            transport: Arc::new(connection),
        })
    }

    async fn prepare_sources(&self) -> Result<PreparedSources> {
        match self.app_config.source_config {
            SourceConfig::Elasticsearch(ref read) => {
                let connection = Connection::open(&read.connection).await?;
                let dialect = resolve_dialect(&connection, read.backend_version).await?;
                let units = IndexSplitter::new(&connection, read, dialect)
                    .split(read.desired_unit_bytes)
                    .await;
                connection.close();
                let units = units?;
                let estimated_bytes = units.iter().filter_map(|u| u.estimated_bytes).sum();
                let sources = units
                    .into_iter()
                    .map(|unit| {
                        SourceBackend::Scroll(Box::new(ScrollReader::new(read.clone(), dialect, unit)))
                    })
                    .collect();
                Ok(PreparedSources {
                    label: format!("📖 {} (dialect {})", read.connection.index, dialect.major),
                    sources,
                    estimated_bytes,
                })
            }
            SourceConfig::File(ref file) => {
                let source = FileSource::new(file.clone()).await?;
                Ok(PreparedSources {
                    label: format!("📂 {}", file.file_name),
                    estimated_bytes: source.file_size,
                    sources: vec![SourceBackend::File(source)],
                })
            }
        }
    }

    /// 📖 Queue every source, start `source_parallelism` workers to drain them.
    fn start_source_stage(
        &self,
        sources: Vec<SourceBackend>,
        progress: &Arc<Mutex<ProgressMetrics>>,
    ) -> (Vec<JoinHandle<Result<()>>>, async_channel::Receiver<DocBatch>) {
        let runtime = &self.app_config.runtime;
        let (work_tx, work_rx) = async_channel::unbounded::<SourceBackend>();
        for source in sources {
            // 📬 unbounded and never closed early: this cannot fail while work_rx is alive
            let _ = work_tx.try_send(source);
        }
        work_tx.close();

        let (bundle_tx, bundle_rx) = async_channel::bounded::<DocBatch>(runtime.queue_capacity);
        let workers = (0..runtime.source_parallelism)
            .map(|id| {
                SourceWorker::new(id, work_rx.clone(), bundle_tx.clone(), progress.clone()).start()
            })
            .collect();
        (workers, bundle_rx)
    }

    /// ✍️ Unbuffered workers, or a dispatcher plus one worker per shard key.
    fn start_sink_stage(
        &self,
        bundles: async_channel::Receiver<DocBatch>,
        sink: PreparedSink,
        progress: &Arc<Mutex<ProgressMetrics>>,
    ) -> Result<Vec<JoinHandle<Result<()>>>> {
        let bulk = &self.app_config.sink_config.bulk;
        let mut workers = Vec::new();

        if bulk.buffering_implies_stateful() {
            warn!("⚠️ max_buffering_duration_ms is set, so stateful batching is switched on too");
        }
        if !bulk.is_stateful() {
            for id in 0..self.app_config.runtime.sink_parallelism {
                let batcher = BulkBatcher::from_config(sink.transport.clone(), bulk)?;
                workers.push(
                    SinkWorker::new(id, bundles.clone(), sink.builder.clone(), batcher, progress.clone())
                        .start(),
                );
            }
            return Ok(workers);
        }

        let shards = bulk.max_parallel_requests;
        let mut shard_txs = Vec::with_capacity(shards);
        for key in 0..shards {
            let (tx, rx) = async_channel::bounded(bulk.max_batch_size);
            shard_txs.push(tx);
            let batcher = BulkBatcher::from_config(sink.transport.clone(), bulk)?;
            let group = KeyedGroup::new(bulk.max_batch_size, bulk.max_buffering_duration());
            workers.push(KeyedSinkWorker::new(key, rx, group, batcher, progress.clone()).start());
        }
        let assigner = ShardAssigner::new(bulk.shard_assignment, shards);
        workers.push(DispatchWorker::new(bundles, sink.builder, assigner, shard_txs).start());
        Ok(workers)
    }
}

/// ⏳ Wait for every worker. The first failure (in completion order) is the one reported.
///
/// 🚪 A failure also closes the bundle channel: sources fail their next send and release
/// their cursors, sinks finish what is already queued and stop.
async fn join_workers(
    handles: Vec<JoinHandle<Result<()>>>,
    bundle_gate: &async_channel::Receiver<DocBatch>,
) -> Result<()> {
    let mut pending: FuturesUnordered<JoinHandle<Result<()>>> = handles.into_iter().collect();
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = pending.next().await {
        let result = joined
            .context("💀 a worker panicked or was cancelled")
            .and_then(|r| r);
        if let Err(e) = result {
            if first_error.is_none() {
                bundle_gate.close();
                first_error = Some(e);
            } else {
                debug!("⚠️ follow-up worker failure: {e:#}");
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
