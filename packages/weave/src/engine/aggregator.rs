//! The aggregator: one actor task owning the merge index, the debounce
//! controller, and the subscription manager, plus the cloneable handle the
//! UI collaborator talks to.
//!
//! Everything that mutates shared state flows through one fan-in channel:
//! UI commands, stream events, debounce and grace timer firings. The actor
//! drains whatever is immediately available, applies it, then projects and
//! notifies once, so event bursts cost one render at most.

use crate::engine::compiler;
use crate::engine::debounce::DebounceController;
use crate::engine::index::MergeIndex;
use crate::engine::projector;
use crate::engine::subscription::{RetryPolicy, SubscriptionManager};
use crate::engine::types::{
    FastMap, FieldPath, FilterSpec, Generation, Page, Record, Signal, SortDirection, SubQuery,
    ViewState, DEFAULT_PAGE_SIZE,
};
use crate::store::{ChangeEvent, DocumentStore, StoreCapabilities};
use anyhow::{anyhow, Result};
use smol_str::SmolStr;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};
use ulid::Ulid;

pub type ViewCallback = Box<dyn Fn(Page) + Send + 'static>;
pub type SignalCallback = Box<dyn Fn(Signal) + Send + 'static>;

/// Per-view configuration: which fields the search box covers, the default
/// order when no term is active, and the timing knobs.
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    pub search_fields: Vec<FieldPath>,
    pub default_order: FieldPath,
    pub quiet_period: Duration,
    pub rollover_grace: Duration,
    pub retry: RetryPolicy,
    pub page_size: usize,
}

impl AggregatorConfig {
    pub fn new(
        search_fields: impl IntoIterator<Item = FieldPath>,
        default_order: impl Into<FieldPath>,
    ) -> Self {
        Self {
            search_fields: search_fields.into_iter().collect(),
            default_order: default_order.into(),
            quiet_period: Duration::from_millis(250),
            rollover_grace: Duration::from_millis(2000),
            retry: RetryPolicy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_quiet_period(mut self, quiet_period: Duration) -> Self {
        self.quiet_period = quiet_period;
        self
    }

    pub fn with_rollover_grace(mut self, grace: Duration) -> Self {
        self.rollover_grace = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }
}

/// Fan-in messages. Commands come from the handle, the rest from stream
/// and timer tasks.
pub(crate) enum Msg {
    Command(Command),
    Stream {
        gen: Generation,
        sub_query_id: SmolStr,
        event: ChangeEvent,
    },
    StreamError {
        gen: Generation,
        sub_query_id: SmolStr,
        order_field: FieldPath,
        error: String,
        terminal: bool,
    },
    DebounceFired {
        token: u64,
    },
    GraceExpired {
        gen: Generation,
    },
}

pub(crate) enum Command {
    SetFilterSpec(FilterSpec),
    SetSearchTerm(String),
    SetSort(FieldPath, SortDirection),
    SetPage(usize),
    SetPageSize(usize),
    OnViewChanged(ViewCallback),
    OnSignal(SignalCallback),
    GetPage(oneshot::Sender<Page>),
    GetSnapshot(oneshot::Sender<Vec<Record>>),
    Dispose,
}

/// Cloneable handle to one live view instance. All setters are
/// fire-and-forget; they enqueue onto the actor and return immediately.
/// After `dispose` every call becomes a no-op.
#[derive(Clone)]
pub struct LiveViewAggregator {
    tx: mpsc::UnboundedSender<Msg>,
}

impl LiveViewAggregator {
    /// Spawn the actor. Must be called from within a tokio runtime.
    ///
    /// Store connectivity is probed once here: if `capabilities()` fails the
    /// aggregator comes up in a fatal state that serves nothing and raises
    /// `Signal::Fatal`, rather than presenting an empty index as
    /// authoritative.
    pub fn spawn(store: Arc<dyn DocumentStore>, config: AggregatorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = SmolStr::new(Ulid::new().to_string());

        let fatal = match store.capabilities() {
            Ok(caps) => {
                let task = AggregatorTask::new(store, caps, config, tx.clone());
                let span = info_span!("aggregator", instance = %instance);
                tokio::spawn(task.run(rx).instrument(span));
                return Self { tx };
            }
            Err(e) => e,
        };

        error!(instance = %instance, error = %fatal, "backing store unavailable at startup");
        tokio::spawn(run_fatal(rx, fatal.to_string()));
        Self { tx }
    }

    fn send(&self, cmd: Command) {
        let _ = self.tx.send(Msg::Command(cmd));
    }

    /// Replace the whole filter spec immediately (a discrete user action,
    /// e.g. the filter drawer's Apply button).
    pub fn set_filter_spec(&self, spec: FilterSpec) {
        self.send(Command::SetFilterSpec(spec));
    }

    /// Update only the search term, debounced through the quiet period.
    pub fn set_search_term(&self, term: impl Into<String>) {
        self.send(Command::SetSearchTerm(term.into()));
    }

    pub fn set_sort(&self, field: impl Into<FieldPath>, dir: SortDirection) {
        self.send(Command::SetSort(field.into(), dir));
    }

    pub fn set_page(&self, page: usize) {
        self.send(Command::SetPage(page));
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.send(Command::SetPageSize(page_size));
    }

    /// Register a render callback. It fires with the current page right
    /// away, then on every change of the projected page's content.
    pub fn on_view_changed(&self, callback: impl Fn(Page) + Send + 'static) {
        self.send(Command::OnViewChanged(Box::new(callback)));
    }

    /// Register a health-signal callback. Signals raised before the first
    /// registration are buffered and replayed to it.
    pub fn on_signal(&self, callback: impl Fn(Signal) + Send + 'static) {
        self.send(Command::OnSignal(Box::new(callback)));
    }

    /// Current projected page.
    pub async fn page(&self) -> Result<Page> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetPage(reply));
        rx.await.map_err(|_| anyhow!("aggregator disposed"))
    }

    /// Raw merged index contents, unsorted. Mostly useful for tests and
    /// debugging endpoints.
    pub async fn snapshot(&self) -> Result<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetSnapshot(reply));
        rx.await.map_err(|_| anyhow!("aggregator disposed"))
    }

    /// Tear down every subscription and stop the actor.
    pub fn dispose(&self) {
        self.send(Command::Dispose);
    }
}

/// Degraded replacement loop for a store that was unreachable at startup:
/// replays `Fatal` to signal registrants, answers queries with empty pages,
/// ignores everything else.
async fn run_fatal(mut rx: mpsc::UnboundedReceiver<Msg>, error: String) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Msg::Command(Command::OnSignal(cb)) => {
                cb(Signal::Fatal {
                    error: error.clone(),
                });
            }
            Msg::Command(Command::GetPage(reply)) => {
                let _ = reply.send(Page::default());
            }
            Msg::Command(Command::GetSnapshot(reply)) => {
                let _ = reply.send(Vec::new());
            }
            Msg::Command(Command::Dispose) => break,
            _ => {}
        }
    }
}

struct AggregatorTask {
    caps: StoreCapabilities,
    config: AggregatorConfig,
    fan_in: mpsc::UnboundedSender<Msg>,
    index: MergeIndex,
    view: ViewState,
    spec: FilterSpec,
    debounce: DebounceController,
    subs: SubscriptionManager,
    /// Residual predicates per active sub-query id.
    active_queries: FastMap<SmolStr, SubQuery>,
    /// Order fields whose streams failed past the retry budget; excluded
    /// from every subsequent compile.
    failed_fields: HashSet<FieldPath>,
    reported_coverage: HashSet<FieldPath>,
    view_callbacks: Vec<ViewCallback>,
    signal_callbacks: Vec<SignalCallback>,
    signal_buffer: Vec<Signal>,
    last_fingerprint: Option<String>,
    disposed: bool,
}

impl AggregatorTask {
    fn new(
        store: Arc<dyn DocumentStore>,
        caps: StoreCapabilities,
        config: AggregatorConfig,
        fan_in: mpsc::UnboundedSender<Msg>,
    ) -> Self {
        let subs = SubscriptionManager::new(store, fan_in.clone(), config.retry);
        let mut view = ViewState::new(config.default_order.clone());
        view.page_size = config.page_size;
        let spec = FilterSpec::new(config.search_fields.clone());
        let debounce = DebounceController::new(config.quiet_period);

        Self {
            caps,
            config,
            fan_in,
            index: MergeIndex::new(),
            view,
            spec,
            debounce,
            subs,
            active_queries: FastMap::default(),
            failed_fields: HashSet::new(),
            reported_coverage: HashSet::new(),
            view_callbacks: Vec::new(),
            signal_callbacks: Vec::new(),
            signal_buffer: Vec::new(),
            last_fingerprint: None,
            disposed: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        info!(fields = self.config.search_fields.len(), "aggregator started");

        // Open the default (no search term) generation right away.
        let initial = self.spec.clone();
        self.commit(initial);
        self.refresh_view();

        while let Some(msg) = rx.recv().await {
            self.handle(msg);
            // Drain the burst before projecting once.
            while !self.disposed {
                match rx.try_recv() {
                    Ok(msg) => self.handle(msg),
                    Err(_) => break,
                }
            }
            if self.disposed {
                break;
            }
            self.refresh_view();
        }

        self.subs.shutdown();
        debug!("aggregator stopped");
    }

    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Command(cmd) => self.handle_command(cmd),
            Msg::Stream {
                gen,
                sub_query_id,
                event,
            } => self.handle_stream(gen, sub_query_id, event),
            Msg::StreamError {
                gen,
                sub_query_id,
                order_field,
                error,
                terminal,
            } => self.handle_stream_error(gen, sub_query_id, order_field, error, terminal),
            Msg::DebounceFired { token } => {
                if let Some(spec) = self.debounce.timer_fired(token) {
                    self.commit(spec);
                }
            }
            Msg::GraceExpired { gen } => {
                if gen == self.index.current_generation() && self.index.rollover_pending() {
                    debug!(generation = %gen, "rollover grace expired before all initial batches");
                    self.index.finish_rollover(gen);
                    self.subs.rollover_complete();
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetFilterSpec(spec) => {
                self.spec = spec.clone();
                if let Some(spec) = self.debounce.commit_now(spec) {
                    self.commit(spec);
                }
            }
            Command::SetSearchTerm(term) => {
                self.spec.search_term = term;
                if let Some(arm) = self.debounce.input(self.spec.clone()) {
                    self.arm_debounce_timer(arm.token, arm.delay);
                }
            }
            Command::SetSort(field, dir) => {
                self.view.sort_field = field;
                self.view.sort_dir = dir;
            }
            Command::SetPage(page) => {
                self.view.page = page;
            }
            Command::SetPageSize(page_size) => {
                self.view.page_size = page_size.max(1);
            }
            Command::OnViewChanged(cb) => {
                cb(self.project());
                self.view_callbacks.push(cb);
            }
            Command::OnSignal(cb) => {
                for signal in self.signal_buffer.drain(..) {
                    cb(signal);
                }
                self.signal_callbacks.push(cb);
            }
            Command::GetPage(reply) => {
                let _ = reply.send(self.project());
            }
            Command::GetSnapshot(reply) => {
                let _ = reply.send(self.index.snapshot());
            }
            Command::Dispose => {
                self.disposed = true;
            }
        }
    }

    /// Apply a committed spec, then drain any intents that queued while the
    /// apply was in flight. Never more than one apply at a time.
    fn commit(&mut self, spec: FilterSpec) {
        let mut next = Some(spec);
        while let Some(spec) = next {
            self.apply_spec(spec);
            next = self.debounce.commit_finished();
        }
    }

    fn apply_spec(&mut self, spec: FilterSpec) {
        self.spec = spec.clone();

        let mut effective = spec;
        effective
            .search_fields
            .retain(|f| !self.failed_fields.contains(f));

        let outcome = compiler::compile(&effective, &self.config.default_order, &self.caps);

        for field in &outcome.skipped {
            if self.reported_coverage.insert(field.clone()) {
                self.emit(Signal::PartialCoverage {
                    field: field.clone(),
                });
            }
        }

        self.active_queries = outcome
            .sub_queries
            .iter()
            .map(|q| (q.id.clone(), q.clone()))
            .collect();

        let Some((gen, expected)) = self.subs.apply(outcome) else {
            return; // unchanged spec, nothing to do
        };

        debug!(
            generation = %gen,
            sub_queries = expected.len(),
            open_streams = self.subs.open_count(),
            "applied new filter generation"
        );
        self.index.begin_generation(gen, expected);
        self.view.page = 0;

        if self.index.rollover_pending() {
            self.arm_grace_timer(gen);
        } else {
            // Zero sub-queries (every field skipped or failed): the rollover
            // settled immediately and nothing old should linger.
            self.subs.rollover_complete();
        }
    }

    fn handle_stream(&mut self, gen: Generation, sub_query_id: SmolStr, event: ChangeEvent) {
        // Stale generations are dropped unread; this is the only gate a
        // superseded stream's events ever reach.
        if gen != self.index.current_generation() {
            return;
        }

        match event {
            ChangeEvent::Initial(batch) => {
                let records = self.apply_residual_batch(&sub_query_id, batch);
                let complete = self.index.initial_batch(gen, &sub_query_id, records);
                self.subs.initial_done(&sub_query_id);
                if complete {
                    self.subs.rollover_complete();
                }
            }
            ChangeEvent::Added(record) | ChangeEvent::Modified(record) => {
                if self.passes_residual(&sub_query_id, &record) {
                    self.index.upsert(gen, record);
                } else {
                    // The store matched it, the client-side residual does
                    // not: for this view the entity does not exist.
                    self.index.delete(gen, &record.id);
                }
            }
            ChangeEvent::Removed(id) => {
                self.index.delete(gen, &id);
            }
        }
    }

    fn handle_stream_error(
        &mut self,
        gen: Generation,
        sub_query_id: SmolStr,
        order_field: FieldPath,
        error: String,
        terminal: bool,
    ) {
        if gen != self.index.current_generation() {
            return; // a superseded stream's troubles are irrelevant
        }

        self.emit(Signal::PartialDegradation {
            sub_query_id: sub_query_id.clone(),
            error,
        });

        if terminal {
            warn!(sub_query = %sub_query_id, field = %order_field, "excluding field from search coverage");
            self.failed_fields.insert(order_field);
            self.subs.remove_stream(&sub_query_id);
            if self.index.abandon_initial(gen, &sub_query_id) {
                self.subs.rollover_complete();
            }
        }
    }

    fn apply_residual_batch(&self, sub_query_id: &str, batch: Vec<Record>) -> Vec<Record> {
        match self.active_queries.get(sub_query_id) {
            Some(q) if !q.residual.is_empty() => batch
                .into_iter()
                .filter(|r| q.matches_residual(r))
                .collect(),
            _ => batch,
        }
    }

    fn passes_residual(&self, sub_query_id: &str, record: &Record) -> bool {
        self.active_queries
            .get(sub_query_id)
            .map(|q| q.matches_residual(record))
            .unwrap_or(true)
    }

    fn project(&self) -> Page {
        projector::project(self.index.snapshot(), &self.view)
    }

    /// Project once per drained message batch and notify only when the
    /// visible page actually changed.
    fn refresh_view(&mut self) {
        let page = self.project();
        let fingerprint = projector::page_fingerprint(&page);
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) {
            return;
        }
        self.last_fingerprint = Some(fingerprint);
        for cb in &self.view_callbacks {
            cb(page.clone());
        }
    }

    fn emit(&mut self, signal: Signal) {
        if self.signal_callbacks.is_empty() {
            self.signal_buffer.push(signal);
            return;
        }
        for cb in &self.signal_callbacks {
            cb(signal.clone());
        }
    }

    fn arm_debounce_timer(&self, token: u64, delay: Duration) {
        let fan_in = self.fan_in.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = fan_in.send(Msg::DebounceFired { token });
        });
    }

    fn arm_grace_timer(&self, gen: Generation) {
        let fan_in = self.fan_in.clone();
        let grace = self.config.rollover_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            let _ = fan_in.send(Msg::GraceExpired { gen });
        });
    }
}
