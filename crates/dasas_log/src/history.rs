//! Causal history cursor.
//!
//! Entries are yielded in an order consistent with their vector clocks: if
//! one entry's clock happened before another's, it is yielded first. Among
//! entries with no causal relation (concurrent clocks, or entries recorded
//! without a clock) the earlier wall-clock timestamp goes first, then the
//! lower event id. The wall-clock tie-break only keeps output stable; it
//! says nothing about real ordering.
//!
//! The order is decided lazily, one entry per `next()`. Building the cursor
//! compares every pair of clocked entries; [`CausalHistory::newest`] bounds
//! the input for queries over a long log.

use crate::event::EventLogEntry;
use chrono::{DateTime, Utc};
use dasas_core::EventId;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

type ReadyKey = Reverse<(DateTime<Utc>, EventId, usize)>;

/// Restartable iterator over entries in causal order
#[derive(Debug, Clone)]
pub struct CausalHistory {
    entries: Vec<EventLogEntry>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<usize>,
    pending: Vec<usize>,
    ready: BinaryHeap<ReadyKey>,
    position: usize,
}

impl CausalHistory {
    /// Build a cursor over `entries`
    #[must_use]
    pub fn new(entries: Vec<EventLogEntry>) -> Self {
        let n = entries.len();
        let mut successors = vec![Vec::new(); n];
        let mut predecessors = vec![0; n];

        for i in 0..n {
            let Some(a) = entries[i].clock.as_ref() else {
                continue;
            };
            for j in (i + 1)..n {
                let Some(b) = entries[j].clock.as_ref() else {
                    continue;
                };
                if a.happens_before(b) {
                    successors[i].push(j);
                    predecessors[j] += 1;
                } else if b.happens_before(a) {
                    successors[j].push(i);
                    predecessors[i] += 1;
                }
            }
        }

        let mut history = Self {
            entries,
            successors,
            predecessors,
            pending: Vec::new(),
            ready: BinaryHeap::new(),
            position: 0,
        };
        history.rewind();
        history
    }

    /// Build a cursor over the `limit` most recent entries by wall clock.
    /// Entries with equal timestamps keep their input order.
    #[must_use]
    pub fn newest(mut entries: Vec<EventLogEntry>, limit: usize) -> Self {
        if entries.len() > limit {
            entries.sort_by_key(|e| e.timestamp);
            let dropped = entries.len() - limit;
            entries.drain(..dropped);
            tracing::debug!(dropped, kept = limit, "history truncated to newest entries");
        }
        Self::new(entries)
    }

    /// Restart from the first entry
    pub fn rewind(&mut self) {
        self.pending = self.predecessors.clone();
        self.ready = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(idx, _)| self.ready_key(idx))
            .collect();
        self.position = 0;
    }

    /// Entries not yet yielded
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.entries.len().saturating_sub(self.position)
    }

    /// Total entries in the history
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the history has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ready_key(&self, idx: usize) -> ReadyKey {
        let entry = &self.entries[idx];
        Reverse((entry.timestamp, entry.id, idx))
    }
}

impl Iterator for CausalHistory {
    type Item = EventLogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, _, idx)) = self.ready.pop()?;
        for k in 0..self.successors[idx].len() {
            let succ = self.successors[idx][k];
            self.pending[succ] -= 1;
            if self.pending[succ] == 0 {
                let key = self.ready_key(succ);
                self.ready.push(key);
            }
        }
        self.position += 1;
        Some(self.entries[idx].clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for CausalHistory {}
