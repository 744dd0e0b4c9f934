//! 📦 batcher.rs: the shopping cart for bulk lines.
//!
//! Lines go in one at a time. When the cart holds `max_batch_size` lines or
//! `max_batch_size_bytes` bytes, it goes to the checkout: one NDJSON body, one trip
//! through the [`RetryExecutor`], one look at the receipt ([`check_for_errors`]).
//!
//! 🧹 The cart is emptied as soon as the round trip succeeds, before the receipt is read,
//! so a partial failure never gets the same lines re-sent by a later flush.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::backends::BulkTransport;
use crate::error::Result;
use crate::write::BulkConfig;
use crate::write::entity::BulkLine;
use crate::write::response::check_for_errors;
use crate::write::retry::RetryExecutor;

/// 🧾 What one flush moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    pub docs: usize,
    pub bytes: u64,
    pub attempts: u32,
}

/// 📦 Count- and size-bounded accumulator in front of one transport.
#[derive(Debug)]
pub struct BulkBatcher {
    transport: Arc<dyn BulkTransport>,
    executor: RetryExecutor,
    allowed_errors: Arc<HashSet<String>>,
    max_docs: usize,
    max_bytes: u64,
    lines: Vec<BulkLine>,
    pending_bytes: u64,
}

impl BulkBatcher {
    pub fn new(
        transport: Arc<dyn BulkTransport>,
        executor: RetryExecutor,
        allowed_errors: Arc<HashSet<String>>,
        max_docs: usize,
        max_bytes: u64,
    ) -> Self {
        Self {
            transport,
            executor,
            allowed_errors,
            max_docs,
            max_bytes,
            lines: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// 🔧 Limits, policy and allowed errors straight from the config.
    pub fn from_config(transport: Arc<dyn BulkTransport>, config: &BulkConfig) -> Result<Self> {
        Ok(Self::new(
            transport,
            RetryExecutor::new(config.retry_policy()?),
            Arc::new(config.allowed_error_set()),
            config.max_batch_size,
            config.max_batch_size_bytes,
        ))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    /// ➕ Add a line; flush if that filled the cart.
    pub async fn add(&mut self, line: BulkLine) -> Result<Option<FlushOutcome>> {
        self.pending_bytes += line.byte_len();
        self.lines.push(line);
        if self.lines.len() >= self.max_docs || self.pending_bytes >= self.max_bytes {
            return self.flush().await;
        }
        Ok(None)
    }

    /// 🚀 Send whatever is in the cart. An empty cart stays home.
    pub async fn flush(&mut self) -> Result<Option<FlushOutcome>> {
        if self.lines.is_empty() {
            return Ok(None);
        }
        let docs = self.lines.len();
        let bytes = self.pending_bytes;
        debug!("📦 flushing bulk batch: {docs} doc(s), {bytes} byte(s)");

        let mut body = String::with_capacity(bytes as usize);
        for line in &self.lines {
            line.write_ndjson(&mut body);
        }

        let outcome = self.executor.send(self.transport.as_ref(), &body).await?;
        self.lines.clear();
        self.pending_bytes = 0;

        check_for_errors(&outcome.response, &self.allowed_errors)?;
        Ok(Some(FlushOutcome {
            docs,
            bytes,
            attempts: outcome.attempts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectorError;
    use crate::write::entity::BulkOp;
    use crate::write::retry::tests::{ScriptedTransport, ok_reply};
    use serde_json::json;

    fn line(n: usize) -> BulkLine {
        BulkLine {
            op: BulkOp::Index,
            header: "{}".to_string(),
            body: Some(format!(r#"{{"n":{n}}}"#)),
        }
    }

    fn batcher(transport: Arc<ScriptedTransport>, max_docs: usize, max_bytes: u64) -> BulkBatcher {
        BulkBatcher::new(
            transport,
            RetryExecutor::default(),
            Arc::new(HashSet::new()),
            max_docs,
            max_bytes,
        )
    }

    #[tokio::test]
    async fn the_one_where_an_empty_cart_stays_home() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let mut batcher = batcher(transport.clone(), 10, 1_000);
        assert_eq!(batcher.flush().await?, None);
        assert_eq!(transport.sends(), 0);
        assert!(batcher.is_empty());
        assert_eq!(batcher.pending_bytes(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_third_line_tips_it_over() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let mut batcher = batcher(transport.clone(), 3, 1_000_000);
        assert_eq!(batcher.add(line(1)).await?, None);
        assert_eq!(batcher.add(line(2)).await?, None);
        let flushed = batcher.add(line(3)).await?.expect("💀 third line should flush");
        assert_eq!(flushed.docs, 3);
        assert_eq!(transport.sends(), 1);
        let sent = transport.sent.lock().map(|s| s[0].clone()).unwrap_or_default();
        assert_eq!(
            sent,
            "{\"index\":{}}\n{\"n\":1}\n{\"index\":{}}\n{\"n\":2}\n{\"index\":{}}\n{\"n\":3}\n"
        );
        assert_eq!(flushed.bytes, sent.len() as u64);
        assert!(batcher.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bytes_run_out_before_docs_do() -> anyhow::Result<()> {
        let transport = Arc::new(ScriptedTransport::default());
        let one_line = line(1).byte_len();
        let mut batcher = batcher(transport.clone(), 1_000, one_line * 2);
        assert_eq!(batcher.add(line(1)).await?, None);
        assert!(batcher.add(line(2)).await?.is_some());
        assert_eq!(transport.sends(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_partial_failure_still_empties_the_cart() -> anyhow::Result<()> {
        let failed = json!({"errors": true, "items": [
            {"index": {"_id": "9", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "nope"}}}
        ]})
        .to_string();
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(failed), Ok(ok_reply())]));
        let mut batcher = batcher(transport.clone(), 10, 1_000_000);
        batcher.add(line(1)).await?;
        let err = batcher.flush().await.expect_err("💀 mapper failure should surface");
        assert!(matches!(err, ConnectorError::PartialBulkFailure(_)));
        assert!(batcher.is_empty());
        assert_eq!(batcher.flush().await?, None);
        assert_eq!(transport.sends(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_transport_failure_keeps_the_lines() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(ConnectorError::Connection(
            "refused".to_string(),
        ))]));
        let mut batcher = batcher(transport, 10, 1_000_000);
        let _ = batcher.add(line(1)).await;
        assert!(batcher.flush().await.is_err());
        assert_eq!(batcher.len(), 1);
    }
}
