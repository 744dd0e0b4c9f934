//! 🔑 keyed.rs: the buffered mode's bookkeeping, minus the async.
//!
//! [`ShardAssigner`] decides which of the `N` parallel shard keys a line belongs to.
//! [`KeyedGroup`] holds the lines of one key until there are enough of them or the oldest
//! one has waited long enough. Neither touches a clock on its own: callers pass `now` in,
//! which keeps the timing rules testable without sleeping through the test suite.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tokio::time::Instant;

use crate::write::ShardAssignment;
use crate::write::entity::BulkLine;

/// 🧮 Spreads lines over `shards` keys.
#[derive(Debug, Clone)]
pub struct ShardAssigner {
    strategy: ShardAssignment,
    shards: usize,
    next: usize,
}

impl ShardAssigner {
    pub fn new(strategy: ShardAssignment, shards: usize) -> Self {
        Self {
            strategy,
            shards: shards.max(1),
            next: 0,
        }
    }

    pub fn shards(&self) -> usize {
        self.shards
    }

    pub fn assign(&mut self, line: &BulkLine) -> usize {
        match self.strategy {
            ShardAssignment::RoundRobin => {
                let key = self.next;
                self.next = (self.next + 1) % self.shards;
                key
            }
            ShardAssignment::Hash => {
                // #️⃣ same action header, same key: writes to one id stay in order
                let mut hasher = DefaultHasher::new();
                line.op.hash(&mut hasher);
                line.header.hash(&mut hasher);
                (hasher.finish() % self.shards as u64) as usize
            }
        }
    }
}

/// 🧺 Lines waiting for one shard key.
#[derive(Debug)]
pub struct KeyedGroup {
    max_docs: usize,
    max_wait: Option<Duration>,
    lines: Vec<BulkLine>,
    opened_at: Option<Instant>,
}

impl KeyedGroup {
    pub fn new(max_docs: usize, max_wait: Option<Duration>) -> Self {
        Self {
            max_docs: max_docs.max(1),
            max_wait,
            lines: Vec::new(),
            opened_at: None,
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// ➕ Add a line. Hands back the group's lines once the count threshold is met.
    pub fn push_at(&mut self, line: BulkLine, now: Instant) -> Option<Vec<BulkLine>> {
        if self.lines.is_empty() {
            self.opened_at = Some(now);
        }
        self.lines.push(line);
        if self.lines.len() >= self.max_docs {
            return Some(self.drain());
        }
        None
    }

    /// ⏰ When the oldest waiting line has waited long enough. `None` without a timer or lines.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.opened_at, self.max_wait) {
            (Some(opened_at), Some(max_wait)) => Some(opened_at + max_wait),
            _ => None,
        }
    }

    /// ⏰ Hands back the lines if the deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<Vec<BulkLine>> {
        match self.deadline() {
            Some(deadline) if now >= deadline && !self.lines.is_empty() => Some(self.drain()),
            _ => None,
        }
    }

    /// 🧹 Everything, now. Used at end of stream.
    pub fn drain(&mut self) -> Vec<BulkLine> {
        self.opened_at = None;
        std::mem::take(&mut self.lines)
    }
}
