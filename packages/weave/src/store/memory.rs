//! In-process document store with live subscriptions.
//!
//! Backs the integration tests and the host server. Predicate evaluation
//! uses the same semantics the abstract contract promises a remote store
//! would have: exact equality, case-folded half-open ranges.

use super::{ChangeEvent, ChangeStream, DocumentStore, StoreCapabilities};
use crate::engine::eval;
use crate::engine::types::{FastMap, Record, RowKey, SubQuery};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Mutation kinds accepted by [`MemoryStore::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Create,
    Update,
    Delete,
}

impl StoreOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" | "CREATE" => Some(StoreOp::Create),
            "update" | "UPDATE" => Some(StoreOp::Update),
            "delete" | "DELETE" => Some(StoreOp::Delete),
            _ => None,
        }
    }
}

struct Subscriber {
    id: u64,
    query: SubQuery,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct Inner {
    rows: FastMap<RowKey, Record>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    /// Successful subscribes over the store's lifetime.
    total_subscribes: u64,
    /// Injected subscribe failures per order field, for stream-error tests.
    fail_subscribes: FastMap<String, u32>,
    unavailable: bool,
}

pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    caps: StoreCapabilities,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::full())
    }

    pub fn with_capabilities(caps: StoreCapabilities) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            caps,
        }
    }

    /// Bulk-load records. Live subscribers receive the resulting events.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        for rec in records {
            self.put(rec);
        }
    }

    pub fn upsert(&self, id: impl Into<RowKey>, fields: Value) {
        self.put(Record::from_json(id, fields));
    }

    pub fn apply(&self, op: StoreOp, id: impl Into<RowKey>, fields: Value) {
        match op {
            StoreOp::Create | StoreOp::Update => self.upsert(id, fields),
            StoreOp::Delete => self.remove(id),
        }
    }

    pub fn put(&self, rec: Record) {
        let mut inner = self.inner.lock().expect("store lock");
        let previous = inner.rows.insert(rec.id.clone(), rec.clone());
        notify(&mut inner, previous.as_ref(), Some(&rec));
    }

    pub fn remove(&self, id: impl Into<RowKey>) {
        let id = id.into();
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(previous) = inner.rows.remove(&id) {
            notify(&mut inner, Some(&previous), None);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock").rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("store lock").subscribers.len()
    }

    /// Total successful subscribes ever made, useful for asserting that a
    /// re-applied spec did not resubscribe.
    pub fn subscribe_count(&self) -> u64 {
        self.inner.lock().expect("store lock").total_subscribes
    }

    /// Make the next `count` subscribes for queries ordered by `field` fail.
    pub fn fail_subscribes_on(&self, field: &str, count: u32) {
        self.inner
            .lock()
            .expect("store lock")
            .fail_subscribes
            .insert(field.to_string(), count);
    }

    /// Simulate the store being unreachable (capabilities queries fail).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().expect("store lock").unavailable = unavailable;
    }
}

fn matches(query: &SubQuery, rec: &Record) -> bool {
    query.predicates.iter().all(|p| p.matches(rec))
}

/// Fan a mutation out to every live subscription, translating the row
/// transition into the subscriber-relative event.
fn notify(inner: &mut Inner, previous: Option<&Record>, current: Option<&Record>) {
    inner.subscribers.retain(|sub| {
        let was = previous.map(|r| matches(&sub.query, r)).unwrap_or(false);
        let is = current.map(|r| matches(&sub.query, r)).unwrap_or(false);

        let event = match (was, is) {
            (false, true) => ChangeEvent::Added(current.expect("present").clone()),
            (true, true) => ChangeEvent::Modified(current.expect("present").clone()),
            (true, false) => {
                let id = previous.expect("present").id.clone();
                ChangeEvent::Removed(id)
            }
            (false, false) => return true,
        };

        // A closed receiver means the stream was dropped; reap it.
        sub.tx.send(event).is_ok()
    });
}

impl DocumentStore for MemoryStore {
    fn capabilities(&self) -> Result<StoreCapabilities> {
        if self.inner.lock().expect("store lock").unavailable {
            return Err(anyhow!("store unavailable"));
        }
        Ok(self.caps.clone())
    }

    fn subscribe(&self, query: &SubQuery) -> Result<ChangeStream> {
        let mut inner = self.inner.lock().expect("store lock");

        if let Some(remaining) = inner.fail_subscribes.get_mut(&query.order_field.to_string()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("injected subscribe failure"));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();

        // Initial full result set, in the order field's range order.
        let mut initial: Vec<Record> = inner
            .rows
            .values()
            .filter(|r| matches(query, r))
            .cloned()
            .collect();
        initial.sort_by(|a, b| {
            eval::compare_values(a.field(&query.order_field), b.field(&query.order_field))
                .then_with(|| a.id.cmp(&b.id))
        });
        let _ = tx.send(ChangeEvent::Initial(initial));

        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.total_subscribes += 1;
        inner.subscribers.push(Subscriber {
            id,
            query: query.clone(),
            tx,
        });
        debug!(sub_query = %query.id, subscriber = id, "memory store subscription opened");

        let weak = Arc::downgrade(&self.inner);
        Ok(ChangeStream::new(rx, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().expect("store lock");
                inner.subscribers.retain(|s| s.id != id);
            }
        }))
    }
}
