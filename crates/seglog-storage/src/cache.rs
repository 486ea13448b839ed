//! Bounded in-memory cache of recently appended batches.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use seglog_types::Offset;

use crate::batch::RecordBatch;

/// Batches keyed by base offset, evicting the oldest over `max_bytes`.
///
/// The most recent batch is always retained, even if it alone exceeds
/// the budget.
#[derive(Debug)]
pub struct BatchCache {
    batches: BTreeMap<Offset, RecordBatch>,
    size_bytes: usize,
    max_bytes: usize,
}

impl BatchCache {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            batches: BTreeMap::new(),
            size_bytes: 0,
            max_bytes,
        }
    }

    pub fn put(&mut self, batch: &RecordBatch) {
        self.size_bytes += batch.size_bytes();
        if let Some(replaced) = self.batches.insert(batch.base_offset(), batch.clone()) {
            self.size_bytes -= replaced.size_bytes();
        }

        while self.size_bytes > self.max_bytes && self.batches.len() > 1 {
            let Some((_, evicted)) = self.batches.pop_first() else {
                break;
            };
            self.size_bytes -= evicted.size_bytes();
        }
    }

    /// Returns the cached batch containing `offset`, if any.
    pub fn get(&self, offset: Offset) -> Option<&RecordBatch> {
        self.batches
            .range(..=offset)
            .next_back()
            .map(|(_, batch)| batch)
            .filter(|batch| batch.last_offset() >= offset)
    }

    /// Evicts every batch holding an offset `>= offset`.
    pub fn truncate(&mut self, offset: Offset) {
        let removed = self.batches.split_off(&offset);
        self.size_bytes -= removed.values().map(RecordBatch::size_bytes).sum::<usize>();

        let straddling = self
            .batches
            .last_key_value()
            .filter(|(_, batch)| batch.last_offset() >= offset)
            .map(|(base, _)| *base);
        if let Some(base) = straddling
            && let Some(batch) = self.batches.remove(&base)
        {
            self.size_bytes -= batch.size_bytes();
        }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl Display for BatchCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{batches:{}, size:{}, max:{}}}",
            self.batches.len(),
            self.size_bytes,
            self.max_bytes
        )
    }
}
