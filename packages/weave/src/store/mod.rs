//! Abstract backing-store contract.
//!
//! The aggregator is store-agnostic: anything that can evaluate equality and
//! single-field range predicates and push change notifications can back a
//! view. The wire protocol of a concrete remote store is out of scope here;
//! [`memory::MemoryStore`] is the in-process reference implementation used
//! by tests and the host server.

pub mod memory;

use crate::engine::types::{FieldPath, Record, RowKey, SubQuery};
use anyhow::Result;
use std::collections::HashSet;
use tokio::sync::mpsc;

/// A change notification for one subscription.
///
/// Every subscription starts with exactly one `Initial` carrying the full
/// current result set, followed by incremental events until the stream is
/// dropped.
#[derive(Clone, Debug)]
pub enum ChangeEvent {
    Initial(Vec<Record>),
    Added(Record),
    Modified(Record),
    Removed(RowKey),
}

/// What the store can evaluate server-side. Queried once at startup; a
/// connectivity error there is the aggregator's fatal path.
#[derive(Clone, Debug)]
pub struct StoreCapabilities {
    /// Whether one sub-query may combine a range predicate with equalities.
    /// Without it, the compiler pushes a single predicate and keeps the rest
    /// as client-side residual.
    pub compound_predicates: bool,
    /// Fields that support range ordering. `None` means all of them do.
    range_fields: Option<HashSet<FieldPath>>,
}

impl StoreCapabilities {
    pub fn full() -> Self {
        Self {
            compound_predicates: true,
            range_fields: None,
        }
    }

    pub fn single_predicate() -> Self {
        Self {
            compound_predicates: false,
            range_fields: None,
        }
    }

    /// Restrict range ordering to the given fields.
    pub fn with_range_fields<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<FieldPath>,
    {
        self.range_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn supports_range(&self, field: &FieldPath) -> bool {
        match &self.range_fields {
            Some(fields) => fields.contains(field),
            None => true,
        }
    }
}

/// Live change feed for one sub-query. Dropping the stream unsubscribes;
/// the aggregator additionally guards against late deliveries with
/// generation tags, so unsubscribe timing is never load-bearing.
pub struct ChangeStream {
    events: mpsc::UnboundedReceiver<ChangeEvent>,
    guard: Option<Box<dyn FnOnce() + Send>>,
}

impl ChangeStream {
    pub fn new(
        events: mpsc::UnboundedReceiver<ChangeEvent>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            guard: Some(Box::new(unsubscribe)),
        }
    }

    /// Next event, or `None` when the store closed the stream (an error
    /// condition; orderly shutdown goes through dropping the stream).
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.guard.take() {
            unsubscribe();
        }
    }
}

pub trait DocumentStore: Send + Sync + 'static {
    fn capabilities(&self) -> Result<StoreCapabilities>;

    /// Open a live subscription for one sub-query. The stream delivers
    /// `ChangeEvent::Initial` first, then incremental events.
    fn subscribe(&self, query: &SubQuery) -> Result<ChangeStream>;
}
