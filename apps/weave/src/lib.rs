use anyhow::Context;
use axum::{
    Router,
    extract::{Json, Path, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use weave::store::memory::{MemoryStore, StoreOp};
use weave::{
    AggregatorConfig, FieldPath, FilterSpec, LiveViewAggregator, Signal, SortDirection,
};

// Expose modules for use in main.rs and tests
pub mod logging;

/// One registered view: the aggregator handle plus its configuration and a
/// drainable log of health signals.
pub struct ViewEntry {
    pub aggregator: LiveViewAggregator,
    pub search_fields: Vec<FieldPath>,
    pub signals: Arc<Mutex<Vec<Signal>>>,
}

type Views = Arc<RwLock<HashMap<String, ViewEntry>>>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryStore>,
    pub views: Views,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            views: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }
}

// --- Request DTOs ---

#[derive(Deserialize, Debug)]
pub struct IngestRequest {
    pub op: String,
    pub id: String,
    #[serde(default)]
    pub record: Value,
}

#[derive(Deserialize, Debug)]
pub struct RegisterViewRequest {
    pub id: String,
    pub search_fields: Vec<String>,
    pub default_order: String,
    #[serde(default)]
    pub equalities: serde_json::Map<String, Value>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

#[derive(Deserialize, Debug)]
pub struct UnregisterViewRequest {
    pub id: String,
}

#[derive(Deserialize, Debug)]
pub struct SearchRequest {
    pub id: String,
    pub term: String,
}

#[derive(Deserialize, Debug)]
pub struct FilterRequest {
    pub id: String,
    #[serde(default)]
    pub equalities: serde_json::Map<String, Value>,
    #[serde(default)]
    pub search_term: String,
}

#[derive(Deserialize, Debug)]
pub struct SortRequest {
    pub id: String,
    pub field: String,
    pub dir: SortDirection,
}

#[derive(Deserialize, Debug)]
pub struct PageRequest {
    pub id: String,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

// --- Configuration ---

pub struct Config {
    pub listen_addr: String,
    pub quiet_period_ms: u64,
    pub rollover_grace_ms: u64,
}

pub fn load_config() -> Config {
    Config {
        listen_addr: std::env::var("WEAVE_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8690".to_string()),
        quiet_period_ms: std::env::var("WEAVE_QUIET_PERIOD_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(250),
        rollover_grace_ms: std::env::var("WEAVE_ROLLOVER_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000),
    }
}

// --- Router Setup ---

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/view/register", post(register_view_handler))
        .route("/view/unregister", post(unregister_view_handler))
        .route("/view/search", post(search_handler))
        .route("/view/filter", post(filter_handler))
        .route("/view/sort", post(sort_handler))
        .route("/view/page", post(page_handler))
        .route("/view/:view_id", get(view_handler))
        .route("/view/:view_id/signals", get(signals_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .layer(middleware::from_fn(auth_middleware))
        .with_state(state)
}

// --- Server Lifecycle ---

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    info!("Starting weave server...");

    let config = load_config();
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(config);

    let app = create_app(state.clone());

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind port")?;

    info!(addr = %listen_addr, "Listening for requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, starting graceful shutdown");
    let mut views = state.views.write().await;
    for (id, entry) in views.drain() {
        debug!(view_id = %id, "disposing view");
        entry.aggregator.dispose();
    }
}

// --- Middleware ---

async fn auth_middleware(req: Request, next: Next) -> Response {
    let secret = std::env::var("WEAVE_AUTH_SECRET").unwrap_or_default();
    if secret.is_empty() {
        // No secret configured: open instance (local development, tests).
        return next.run(req).await;
    }

    let auth_header = req.headers().get(AUTHORIZATION);
    match auth_header {
        Some(header) if header.to_str().unwrap_or_default() == format!("Bearer {}", secret) => {
            next.run(req).await
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

// --- Request Handlers ---

/// Apply one document mutation to the store; live views pick it up through
/// their subscriptions.
#[instrument(skip(state, payload), fields(op = %payload.op, id = %payload.id))]
async fn ingest_handler(
    State(state): State<AppState>,
    Json(payload): Json<IngestRequest>,
) -> impl IntoResponse {
    let Some(op) = StoreOp::parse(&payload.op) else {
        warn!(op = %payload.op, "Invalid operation type");
        return StatusCode::BAD_REQUEST;
    };

    state.store.apply(op, payload.id.as_str(), payload.record);
    StatusCode::OK
}

fn equality_spec(
    search_fields: &[FieldPath],
    equalities: &serde_json::Map<String, Value>,
    search_term: String,
) -> FilterSpec {
    let mut spec = FilterSpec::new(search_fields.to_vec()).with_term(search_term);
    for (field, value) in equalities {
        spec = spec.with_equality(field.as_str(), weave::FieldValue::from(value.clone()));
    }
    spec
}

/// Create an aggregator instance for one list view.
#[instrument(skip(state, payload), fields(view_id = %payload.id))]
async fn register_view_handler(
    State(state): State<AppState>,
    Json(payload): Json<RegisterViewRequest>,
) -> impl IntoResponse {
    let mut views = state.views.write().await;
    if views.contains_key(&payload.id) {
        info!(view_id = %payload.id, "View already existed - skipping registration");
        return StatusCode::OK;
    }

    let search_fields: Vec<FieldPath> = payload
        .search_fields
        .iter()
        .map(|f| FieldPath::new(f))
        .collect();

    let mut config = AggregatorConfig::new(search_fields.clone(), payload.default_order.as_str())
        .with_quiet_period(std::time::Duration::from_millis(state.config.quiet_period_ms))
        .with_rollover_grace(std::time::Duration::from_millis(state.config.rollover_grace_ms));
    if let Some(page_size) = payload.page_size {
        config = config.with_page_size(page_size);
    }

    let aggregator = LiveViewAggregator::spawn(state.store.clone(), config);

    let signals = Arc::new(Mutex::new(Vec::new()));
    let sink = signals.clone();
    aggregator.on_signal(move |signal| {
        sink.lock().expect("signal log lock").push(signal);
    });

    if !payload.equalities.is_empty() {
        aggregator.set_filter_spec(equality_spec(
            &search_fields,
            &payload.equalities,
            String::new(),
        ));
    }

    debug!(view_id = %payload.id, fields = search_fields.len(), "registered view");
    views.insert(
        payload.id,
        ViewEntry {
            aggregator,
            search_fields,
            signals,
        },
    );

    StatusCode::OK
}

#[instrument(skip(state), fields(view_id = %payload.id))]
async fn unregister_view_handler(
    State(state): State<AppState>,
    Json(payload): Json<UnregisterViewRequest>,
) -> impl IntoResponse {
    let mut views = state.views.write().await;
    match views.remove(&payload.id) {
        Some(entry) => {
            entry.aggregator.dispose();
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Debounced search-term update.
async fn search_handler(
    State(state): State<AppState>,
    Json(payload): Json<SearchRequest>,
) -> impl IntoResponse {
    let views = state.views.read().await;
    match views.get(&payload.id) {
        Some(entry) => {
            entry.aggregator.set_search_term(payload.term);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Immediate filter replacement (the drawer's Apply).
async fn filter_handler(
    State(state): State<AppState>,
    Json(payload): Json<FilterRequest>,
) -> impl IntoResponse {
    let views = state.views.read().await;
    match views.get(&payload.id) {
        Some(entry) => {
            let spec = equality_spec(&entry.search_fields, &payload.equalities, payload.search_term);
            entry.aggregator.set_filter_spec(spec);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn sort_handler(
    State(state): State<AppState>,
    Json(payload): Json<SortRequest>,
) -> impl IntoResponse {
    let views = state.views.read().await;
    match views.get(&payload.id) {
        Some(entry) => {
            entry.aggregator.set_sort(payload.field.as_str(), payload.dir);
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn page_handler(
    State(state): State<AppState>,
    Json(payload): Json<PageRequest>,
) -> impl IntoResponse {
    let views = state.views.read().await;
    match views.get(&payload.id) {
        Some(entry) => {
            if let Some(page_size) = payload.page_size {
                entry.aggregator.set_page_size(page_size);
            }
            if let Some(page) = payload.page {
                entry.aggregator.set_page(page);
            }
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

/// Current projected page for one view.
async fn view_handler(
    State(state): State<AppState>,
    Path(view_id): Path<String>,
) -> Response {
    let views = state.views.read().await;
    let Some(entry) = views.get(&view_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match entry.aggregator.page().await {
        Ok(page) => Json(page).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Drain and return the view's accumulated health signals.
async fn signals_handler(
    State(state): State<AppState>,
    Path(view_id): Path<String>,
) -> Response {
    let views = state.views.read().await;
    let Some(entry) = views.get(&view_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let drained: Vec<Signal> = std::mem::take(&mut *entry.signals.lock().expect("signal log lock"));
    Json(drained).into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let views = state.views.read().await;
    Json(json!({
        "status": "healthy",
        "views": views.len(),
        "documents": state.store.len(),
    }))
}

async fn version_handler() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
