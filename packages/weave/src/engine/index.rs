//! The merge index: one authoritative map of entity id to latest record.
//!
//! Fed by every live subscription of the current generation; all mutation
//! goes through the owning actor task, so the struct itself needs no locks.
//! Events carrying a non-current generation are dropped unread, which is
//! what makes subscription close race-free.

use crate::engine::types::{FastMap, Generation, Record, RowKey};
use smol_str::SmolStr;
use std::collections::HashSet;
use tracing::debug;

struct Entry {
    record: Record,
    /// Generation that last confirmed this entry. Entries not re-confirmed
    /// by the time a rollover finishes are pruned.
    confirmed: Generation,
}

/// Rollover bookkeeping: which current-generation sub-queries still owe
/// their initial batch.
struct Rollover {
    pending: HashSet<SmolStr>,
}

#[derive(Default)]
pub struct MergeIndex {
    entries: FastMap<RowKey, Entry>,
    current: Generation,
    rollover: Option<Rollover>,
}

impl MergeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_generation(&self) -> Generation {
        self.current
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start a new generation. Prior entries stay visible until the
    /// rollover finishes, so the view never flashes empty while the new
    /// generation's initial batches are in flight.
    pub fn begin_generation(
        &mut self,
        gen: Generation,
        expected: impl IntoIterator<Item = SmolStr>,
    ) {
        debug_assert!(gen > self.current);
        self.current = gen;
        let pending: HashSet<SmolStr> = expected.into_iter().collect();
        self.rollover = Some(Rollover { pending });
        if !self.rollover_pending() {
            self.finish_rollover(gen);
        }
    }

    /// Merge one sub-query's initial result set. Returns `true` when this
    /// completed the rollover (all expected batches arrived).
    pub fn initial_batch(
        &mut self,
        gen: Generation,
        sub_query_id: &str,
        records: Vec<Record>,
    ) -> bool {
        if gen != self.current {
            return false;
        }
        for rec in records {
            self.upsert(gen, rec);
        }
        self.settle_pending(gen, sub_query_id)
    }

    /// A sub-query will never deliver its initial batch (permanent stream
    /// failure). Stop waiting for it. Returns `true` when this completed
    /// the rollover.
    pub fn abandon_initial(&mut self, gen: Generation, sub_query_id: &str) -> bool {
        if gen != self.current {
            return false;
        }
        self.settle_pending(gen, sub_query_id)
    }

    fn settle_pending(&mut self, gen: Generation, sub_query_id: &str) -> bool {
        let Some(rollover) = self.rollover.as_mut() else {
            return false;
        };
        rollover.pending.remove(sub_query_id);
        if rollover.pending.is_empty() {
            self.finish_rollover(gen);
            true
        } else {
            false
        }
    }

    /// Last-write-wins replace of the full record. Stale generations are
    /// dropped unread.
    pub fn upsert(&mut self, gen: Generation, record: Record) -> bool {
        if gen != self.current {
            return false;
        }
        self.entries.insert(
            record.id.clone(),
            Entry {
                record,
                confirmed: gen,
            },
        );
        true
    }

    /// Remove the id globally and immediately. One authoritative stream
    /// saying "gone" wins over siblings that have not reported it yet,
    /// because every stream describes the same underlying entity.
    pub fn delete(&mut self, gen: Generation, id: &str) -> bool {
        if gen != self.current {
            return false;
        }
        self.entries.remove(id).is_some()
    }

    /// Whether a rollover is still waiting on initial batches.
    pub fn rollover_pending(&self) -> bool {
        self.rollover
            .as_ref()
            .map(|r| !r.pending.is_empty())
            .unwrap_or(false)
    }

    /// Prune entries not re-confirmed by the current generation. Called when
    /// every initial batch has arrived, or when the bounded grace window
    /// expires first. Returns the number of pruned entries.
    pub fn finish_rollover(&mut self, gen: Generation) -> usize {
        if gen != self.current || self.rollover.is_none() {
            return 0;
        }
        self.rollover = None;
        let before = self.entries.len();
        let current = self.current;
        self.entries.retain(|_, e| e.confirmed == current);
        let pruned = before - self.entries.len();
        if pruned > 0 {
            debug!(generation = %current, pruned, "pruned entries left over from prior generation");
        }
        pruned
    }

    /// Immutable copy-on-read view, never a live reference.
    pub fn snapshot(&self) -> Vec<Record> {
        self.entries.values().map(|e| e.record.clone()).collect()
    }
}
