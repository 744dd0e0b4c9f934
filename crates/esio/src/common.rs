//! 📦 Common data structures: the shopping cart that documents ride in between stages.
//!
//! A [`DocBatch`] is one bundle: the documents a source produced in one go (one scroll
//! page, one chunk of file lines). On the write side it is also the unit of work for the
//! unbuffered batcher: a bundle begins, lines accumulate, the bundle ends, we flush.
//!
//! 🦆 The documents are plain JSON strings. They don't know where they're going.
//! Neither did we, until `transform` week.

/// 📦 One bundle of raw JSON documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocBatch {
    pub docs: Vec<String>,
}

impl DocBatch {
    pub fn new(docs: Vec<String>) -> Self {
        Self { docs }
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// 📊 Payload bytes across every document. One iterator, one sum, zero feelings.
    pub fn total_bytes(&self) -> usize {
        self.docs.iter().map(|doc| doc.len()).sum()
    }
}
