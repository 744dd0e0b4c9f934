//! 🧵 Workers: the ones who actually do the work while the Supervisor takes all the
//! credit in the sprint retro.
//!
//! Four kinds, all started the same way and all reporting back through a `JoinHandle`:
//! - [`SourceWorker`]: drains sources into the bundle channel
//! - [`SinkWorker`]: unbuffered, one bundle in, one flush out
//! - [`DispatchWorker`]: buffered mode's traffic cop, builds lines and picks shard keys
//! - [`KeyedSinkWorker`]: buffered mode's writer, one per shard key
//!
//! 🔌 Shutdown is carried by the channels. A sender that goes away closes the stage
//! behind it; a receiver that goes away makes the stage in front of it fail its next send.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::progress::ProgressMetrics;
use crate::write::FlushOutcome;

mod dispatch_worker;
mod keyed_sink_worker;
mod sink_worker;
mod source_worker;

pub(super) use dispatch_worker::DispatchWorker;
pub(super) use keyed_sink_worker::KeyedSinkWorker;
pub(super) use sink_worker::SinkWorker;
pub(super) use source_worker::SourceWorker;

/// 🏗️ A background worker, that does work. duh.
pub(super) trait Worker {
    /// 🚀 Spawn it. The handle resolves to the worker's verdict.
    fn start(self) -> JoinHandle<Result<()>>;
}

/// 📊 Count a successful flush. A poisoned lock only costs us the progress display.
fn record_flush(progress: &Arc<Mutex<ProgressMetrics>>, outcome: Option<FlushOutcome>) {
    if let Some(outcome) = outcome {
        if let Ok(mut progress) = progress.lock() {
            progress.record_written(outcome.docs as u64);
        }
    }
}
