use axum::{extract::{Query, State}, http::StatusCode, routing::get, Json, Router};
use search_core::tokenizer::tokenize;
use search_core::{CoordStore, JobQueue, TokenStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
}
fn default_k() -> usize { 10 }

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub took_s: f64,
    pub total_hits: usize,
    pub results: Vec<SearchHit>,
}

#[derive(Serialize)]
pub struct SearchHit {
    pub doc_id: String,
    pub url: Option<String>,
    pub score: f64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub document_count: i64,
    pub idle: usize,
    pub active: usize,
    pub exhausted: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub tokens: TokenStore,
    pub queue: JobQueue,
    pub urls: Arc<HashMap<String, String>>,
}

type ApiError = (StatusCode, String);

fn internal(e: search_core::Error) -> ApiError {
    tracing::error!(error = %e, "store request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// `urls` maps document ids to source URLs for display; ids missing from it
/// are returned without one.
pub fn build_app(store: Arc<dyn CoordStore>, urls: HashMap<String, String>) -> Router {
    let app_state = AppState {
        tokens: TokenStore::new(store.clone()),
        queue: JobQueue::new(store),
        urls: Arc::new(urls),
    };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/stats", get(stats_handler))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let start = std::time::Instant::now();
    let terms: Vec<String> = tokenize(&params.q).into_iter().map(|(t, _)| t).collect();
    // Edge case: nothing left after stopwords
    if terms.is_empty() {
        return Ok(Json(SearchResponse { query: params.q, took_s: start.elapsed().as_secs_f64(), total_hits: 0, results: vec![] }));
    }

    let scored = state.tokens.rank(&terms, usize::MAX).await.map_err(internal)?;
    let total_hits = scored.len();
    let k = params.k.clamp(1, 100);
    let results = scored
        .into_iter()
        .take(k)
        .map(|hit| SearchHit { url: state.urls.get(&hit.doc_id).cloned(), doc_id: hit.doc_id, score: hit.score })
        .collect();

    let took_s = start.elapsed().as_secs_f64();
    tracing::debug!(query = %params.q, total_hits, took_s, "search");
    Ok(Json(SearchResponse { query: params.q, took_s, total_hits, results }))
}

pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        document_count: state.tokens.document_count().await.map_err(internal)?,
        idle: state.queue.idle_len().await.map_err(internal)?,
        active: state.queue.active_len().await.map_err(internal)?,
        exhausted: state.queue.is_exhausted().await.map_err(internal)?,
    }))
}
