//! Subscription lifecycle: one stream task per sub-query, generation
//! tagging, the supersede/replace protocol, and per-stream retry.
//!
//! Stream tasks are dumb producers: they forward every event into the
//! actor's fan-in channel tagged with their owning generation and never
//! look at the merge index. Staleness is decided downstream, which is what
//! makes closing a subscription race-free regardless of in-flight events.

use crate::engine::aggregator::Msg;
use crate::engine::compiler::CompileOutcome;
use crate::engine::types::{FieldPath, Generation, SubQuery};
use crate::store::DocumentStore;
use indexmap::IndexMap;
use smol_str::SmolStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Capped exponential backoff for failed streams.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (1-based), doubling up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

struct StreamHandle {
    sub_query_id: SmolStr,
    order_field: FieldPath,
    close: Arc<Notify>,
}

impl StreamHandle {
    fn close(&self) {
        self.close.notify_one();
    }
}

pub(crate) struct SubscriptionManager {
    store: Arc<dyn DocumentStore>,
    fan_in: mpsc::UnboundedSender<Msg>,
    generation: Generation,
    fingerprint: Option<u64>,
    /// Current-generation streams, keyed by sub-query id.
    current: IndexMap<SmolStr, StreamHandle>,
    /// Prior-generation streams still draining, keyed by order field. Their
    /// events are dropped by generation tag; they are physically closed once
    /// the matching new stream has delivered its initial batch.
    superseded: IndexMap<SmolStr, StreamHandle>,
    retry: RetryPolicy,
}

impl SubscriptionManager {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        fan_in: mpsc::UnboundedSender<Msg>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            fan_in,
            generation: Generation::ZERO,
            fingerprint: None,
            current: IndexMap::new(),
            superseded: IndexMap::new(),
            retry,
        }
    }

    /// Streams currently open against the store, across generations.
    pub(crate) fn open_count(&self) -> usize {
        self.current.len() + self.superseded.len()
    }

    /// Open a new generation of subscriptions. Returns `None` when the
    /// outcome's fingerprint matches the live one (a no-op re-apply),
    /// otherwise the new generation plus the sub-query ids whose initial
    /// batches the merge index should wait for.
    pub(crate) fn apply(&mut self, outcome: CompileOutcome) -> Option<(Generation, Vec<SmolStr>)> {
        if self.fingerprint == Some(outcome.fingerprint) {
            debug!(fingerprint = outcome.fingerprint, "unchanged spec, skipping resubscription");
            return None;
        }
        self.fingerprint = Some(outcome.fingerprint);
        self.generation = self.generation.next();

        // Anything still draining from the generation before last is closed
        // now; this is what bounds open streams to two generations.
        for (_, handle) in self.superseded.drain(..) {
            handle.close();
        }
        let outgoing = std::mem::take(&mut self.current);
        for (_, handle) in outgoing {
            self.superseded
                .insert(SmolStr::new(handle.order_field.to_string()), handle);
        }

        let mut expected = Vec::with_capacity(outcome.sub_queries.len());
        for query in outcome.sub_queries {
            expected.push(query.id.clone());
            let handle = self.spawn_stream(query, self.generation);
            self.current.insert(handle.sub_query_id.clone(), handle);
        }

        Some((self.generation, expected))
    }

    /// The given current-generation sub-query delivered its initial batch;
    /// its superseded counterpart (same order field) can go.
    pub(crate) fn initial_done(&mut self, sub_query_id: &str) {
        if let Some(handle) = self.current.get(sub_query_id) {
            let key = SmolStr::new(handle.order_field.to_string());
            if let Some(old) = self.superseded.shift_remove(&key) {
                debug!(sub_query = sub_query_id, "closing superseded stream");
                old.close();
            }
        }
    }

    /// Rollover finished (every initial batch in, or grace expired): close
    /// whatever superseded streams are still draining.
    pub(crate) fn rollover_complete(&mut self) {
        for (_, handle) in self.superseded.drain(..) {
            handle.close();
        }
    }

    /// Drop a permanently failed stream from the current set.
    pub(crate) fn remove_stream(&mut self, sub_query_id: &str) {
        self.current.shift_remove(sub_query_id);
    }

    /// Close every stream of every generation.
    pub(crate) fn shutdown(&mut self) {
        for (_, handle) in self.current.drain(..) {
            handle.close();
        }
        for (_, handle) in self.superseded.drain(..) {
            handle.close();
        }
    }

    fn spawn_stream(&self, query: SubQuery, gen: Generation) -> StreamHandle {
        let close = Arc::new(Notify::new());
        let handle = StreamHandle {
            sub_query_id: query.id.clone(),
            order_field: query.order_field.clone(),
            close: close.clone(),
        };
        tokio::spawn(run_stream(
            self.store.clone(),
            query,
            gen,
            self.fan_in.clone(),
            close,
            self.retry,
        ));
        handle
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One subscription's lifetime: subscribe, forward events, retry on failure
/// with backoff, report exhaustion. The task only stops on its close signal
/// (or when the aggregator went away); a superseded stream keeps delivering
/// into the fan-in channel until it is physically closed.
async fn run_stream(
    store: Arc<dyn DocumentStore>,
    query: SubQuery,
    gen: Generation,
    fan_in: mpsc::UnboundedSender<Msg>,
    close: Arc<Notify>,
    retry: RetryPolicy,
) {
    let mut attempt: u32 = 0;

    loop {
        let error = match store.subscribe(&query) {
            Ok(mut stream) => {
                loop {
                    tokio::select! {
                        event = stream.recv() => match event {
                            Some(event) => {
                                // Receiving an event resets the retry budget.
                                attempt = 0;
                                let msg = Msg::Stream {
                                    gen,
                                    sub_query_id: query.id.clone(),
                                    event,
                                };
                                if fan_in.send(msg).is_err() {
                                    return;
                                }
                            }
                            // The store closed the stream without an
                            // unsubscribe on our side: treat as a failure.
                            None => break "stream closed by store".to_string(),
                        },
                        _ = close.notified() => return,
                    }
                }
            }
            Err(e) => e.to_string(),
        };

        attempt += 1;
        let terminal = attempt >= retry.max_attempts;
        let _ = fan_in.send(Msg::StreamError {
            gen,
            sub_query_id: query.id.clone(),
            order_field: query.order_field.clone(),
            error: error.clone(),
            terminal,
        });

        if terminal {
            warn!(sub_query = %query.id, error = %error, "stream failed permanently, giving up");
            return;
        }

        let delay = retry.delay(attempt);
        warn!(sub_query = %query.id, error = %error, attempt, ?delay, "stream failed, retrying");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = close.notified() => return,
        }
    }
}
