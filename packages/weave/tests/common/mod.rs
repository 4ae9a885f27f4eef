//! Shared helpers for the aggregator integration tests: fixture records,
//! page/signal collectors, and a polling settle loop.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ulid::Ulid;
use weave::store::memory::MemoryStore;
use weave::{AggregatorConfig, LiveViewAggregator, Page, Signal};

pub fn generate_id() -> String {
    Ulid::new().to_string()
}

pub fn contact(name: &str, email: &str, status: &str) -> Value {
    json!({ "name": name, "email": email, "status": status })
}

/// The contact set most tests run against. `c1` matches "jo" on name with
/// active status; `c2` matches "jo" on email but is archived.
pub fn seed_contacts(store: &MemoryStore) {
    store.upsert("c1", contact("John Doe", "john@x.com", "active"));
    store.upsert("c2", contact("Mary Major", "joanna@x.com", "archived"));
    store.upsert("c3", contact("Ada Lovelace", "ada@x.com", "active"));
    store.upsert("c4", contact("Grace Hopper", "grace@x.com", "active"));
}

/// Standard view config over the contact fixtures: search on name + email,
/// default order by name, short timers so tests settle quickly.
pub fn contact_config() -> AggregatorConfig {
    AggregatorConfig::new(
        vec!["name".into(), "email".into()],
        "name",
    )
    .with_quiet_period(Duration::from_millis(250))
    .with_rollover_grace(Duration::from_millis(500))
}

pub fn row_ids(page: &Page) -> Vec<String> {
    page.rows.iter().map(|r| r.id.as_str().to_owned()).collect()
}

/// Collects every page delivered through `on_view_changed`.
#[derive(Clone, Default)]
pub struct PageLog {
    inner: Arc<Mutex<Vec<Page>>>,
}

impl PageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(Page) + Send + 'static {
        let inner = self.inner.clone();
        move |page| inner.lock().unwrap().push(page)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn latest(&self) -> Option<Page> {
        self.inner.lock().unwrap().last().cloned()
    }

    pub fn all(&self) -> Vec<Page> {
        self.inner.lock().unwrap().clone()
    }
}

/// Collects every signal delivered through `on_signal`.
#[derive(Clone, Default)]
pub struct SignalLog {
    inner: Arc<Mutex<Vec<Signal>>>,
}

impl SignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(Signal) + Send + 'static {
        let inner = self.inner.clone();
        move |signal| inner.lock().unwrap().push(signal)
    }

    pub fn all(&self) -> Vec<Signal> {
        self.inner.lock().unwrap().clone()
    }
}

/// Poll the aggregator until the projected page satisfies the predicate.
/// Under paused time the sleeps auto-advance, so this is deterministic.
pub async fn wait_for_page(
    agg: &LiveViewAggregator,
    pred: impl Fn(&Page) -> bool,
) -> Page {
    for _ in 0..500 {
        let page = agg.page().await.expect("aggregator alive");
        if pred(&page) {
            return page;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("page never reached the expected state");
}
