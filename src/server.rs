//! HTTP API.
//!
//! Exposes every pipeline stage and read model over JSON so a browser UI
//! can drive the tool.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/upload` | Import a CSV export (multipart `file` field or raw body) |
//! | `POST` | `/enrich?limit=` | Enrich pending books from the catalog |
//! | `POST` | `/embed?limit=` | Embed missing or stale books |
//! | `POST` | `/cluster` | Re-cluster embedded books |
//! | `POST` | `/insights/{kind}` | Generate an insight report |
//! | `GET`  | `/insights/history?limit=` | Recent LLM exchanges |
//! | `GET`  | `/insights/history/{id}` | One LLM exchange |
//! | `GET`  | `/stats` | Aggregate reading statistics |
//! | `GET`  | `/stats/{stage}` | `enrichment`, `embedding`, `clustering`, or `insights` |
//! | `GET`  | `/books` | All books |
//! | `GET`  | `/books/{id}/similar?limit=` | Nearest neighbours by embedding |
//! | `GET`  | `/clusters/{id}/books` | Books in a cluster, closest first |
//! | `GET`  | `/clusters/exemplars?limit=` | Exemplars for every cluster |
//! | `POST` | `/reset` | Drop and recreate all tables |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "recommendations need a query" } }
//! ```
//!
//! Error codes: `bad_request` (400), `config_error` (400), `not_found` (404),
//! `external_service` (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a UI served from a
//! different port can call the API.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::books::{books_in_cluster, list_books};
use crate::cluster::{
    all_exemplars, clustering_model, clustering_stats, run_clustering, similar_books,
};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, embed_books, embedding_stats, DisabledProvider, EmbeddingProvider};
use crate::enrich::{enrich_books, enrichment_stats, Catalog, OpenLibraryCatalog};
use crate::error::ShelfError;
use crate::history::{get_history, list_history};
use crate::ingest::{import_csv_bytes, ImportReport};
use crate::insights::{generate, insights_stats, InsightKind, InsightRequest};
use crate::llm::{create_client, LlmClient};
use crate::migrate;
use crate::prompts::PromptSet;
use crate::stats::reading_stats;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 20;
const DEFAULT_SIMILAR_LIMIT: usize = 10;
const DEFAULT_EXEMPLARS: usize = 5;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub catalog: Arc<dyn Catalog>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub llm: Arc<dyn LlmClient>,
    pub prompts: Arc<PromptSet>,
}

impl AppState {
    /// Connect, migrate, and construct the configured service clients.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let embedder = embedding::create_provider(&config.embedding).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "embedding provider unavailable");
            Arc::new(DisabledProvider) as Arc<dyn EmbeddingProvider>
        });

        Ok(Self {
            pool,
            config: Arc::new(config.clone()),
            catalog: Arc::new(OpenLibraryCatalog::new(&config.enrichment)?),
            embedder,
            llm: create_client(&config.llm),
            prompts: Arc::new(PromptSet::load(&config.llm)?),
        })
    }
}

/// Starts the HTTP server on `[server].bind` and runs until terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::from_config(config).await?;
    let app = build_router(state);

    tracing::info!(addr = %bind_addr, "server listening");
    println!("shelf server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/upload", post(handle_upload))
        .route("/enrich", post(handle_enrich))
        .route("/embed", post(handle_embed))
        .route("/cluster", post(handle_cluster))
        .route("/insights/history", get(handle_history_list))
        .route("/insights/history/{id}", get(handle_history_get))
        .route("/insights/{kind}", post(handle_insight))
        .route("/stats", get(handle_stats))
        .route("/stats/{stage}", get(handle_stage_stats))
        .route("/books", get(handle_books))
        .route("/books/{id}/similar", get(handle_similar))
        .route("/clusters/exemplars", get(handle_exemplars))
        .route("/clusters/{id}/books", get(handle_cluster_books))
        .route("/reset", post(handle_reset))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

/// Map the error category onto a status code; anything untyped is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match err.downcast_ref::<ShelfError>() {
            Some(ShelfError::Validation(_)) => bad_request(message),
            Some(ShelfError::Config(_)) => {
                app_error(StatusCode::BAD_REQUEST, "config_error", message)
            }
            Some(ShelfError::NotFound(_)) => app_error(StatusCode::NOT_FOUND, "not_found", message),
            Some(ShelfError::ExternalService { .. }) => {
                app_error(StatusCode::BAD_GATEWAY, "external_service", message)
            }
            None => {
                tracing::error!(error = %message, "request failed");
                app_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Pipeline triggers ============

/// Accepts either `multipart/form-data` with a `file` field or the CSV as
/// the raw request body.
async fn handle_upload(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<ImportReport> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let bytes = if is_multipart {
        let mut multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?;

        let mut file = None;
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| bad_request(e.body_text()))?
        {
            if field.name() == Some("file") {
                file = Some(field.bytes().await.map_err(|e| bad_request(e.body_text()))?);
                break;
            }
        }
        file.ok_or_else(|| bad_request("multipart upload needs a 'file' field"))?
    } else {
        Bytes::from_request(request, &state)
            .await
            .map_err(|e| bad_request(e.body_text()))?
    };

    if bytes.is_empty() {
        return Err(bad_request("upload is empty"));
    }

    let report = import_csv_bytes(&state.pool, &bytes, &state.config.import).await?;
    Ok(Json(report))
}

async fn handle_enrich(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Value> {
    let report = enrich_books(
        &state.pool,
        state.catalog.clone(),
        &state.config.enrichment,
        params.limit,
    )
    .await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn handle_embed(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Value> {
    let report = embed_books(
        &state.pool,
        state.embedder.as_ref(),
        &state.config.embedding,
        params.limit,
    )
    .await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn handle_cluster(State(state): State<AppState>) -> ApiResult<Value> {
    let model = clustering_model(&state.config)?;
    let report = run_clustering(&state.pool, &state.config.clustering, &model).await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

// ============ Insights ============

#[derive(Debug, Default, Deserialize)]
struct InsightBody {
    query: Option<String>,
    limit: Option<usize>,
}

/// `POST /insights/{kind}`. The JSON body is optional except for
/// `recommendations`, which reads `query` and `limit` from it.
async fn handle_insight(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    body: Bytes,
) -> ApiResult<Value> {
    let kind: InsightKind = kind.parse().map_err(anyhow::Error::from)?;

    let body: InsightBody = if body.is_empty() {
        InsightBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))?
    };

    let request = InsightRequest {
        kind,
        query: body.query,
        limit: body.limit,
    };
    let report = generate(&state.pool, state.llm.as_ref(), &state.prompts, &request).await?;
    Ok(Json(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn handle_history_list(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Value> {
    let entries = list_history(&state.pool, params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)).await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

async fn handle_history_get(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let entry = get_history(&state.pool, id).await?;
    Ok(Json(serde_json::to_value(entry).map_err(anyhow::Error::from)?))
}

// ============ Stats ============

async fn handle_stats(State(state): State<AppState>) -> ApiResult<Value> {
    let stats = reading_stats(&state.pool).await?;
    Ok(Json(serde_json::to_value(stats).map_err(anyhow::Error::from)?))
}

async fn handle_stage_stats(
    State(state): State<AppState>,
    Path(stage): Path<String>,
) -> ApiResult<Value> {
    let value = match stage.as_str() {
        "enrichment" => serde_json::to_value(enrichment_stats(&state.pool).await?),
        "embedding" => {
            serde_json::to_value(embedding_stats(&state.pool, &state.config.embedding).await?)
        }
        "clustering" => serde_json::to_value(clustering_stats(&state.pool).await?),
        "insights" => serde_json::to_value(insights_stats(&state.pool, state.llm.as_ref()).await?),
        other => {
            return Err(app_error(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no stats for stage: {}", other),
            ))
        }
    };
    Ok(Json(value.map_err(anyhow::Error::from)?))
}

// ============ Books & clusters ============

async fn handle_books(State(state): State<AppState>) -> ApiResult<Value> {
    let books = list_books(&state.pool).await?;
    Ok(Json(serde_json::json!({ "books": books })))
}

async fn handle_similar(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Value> {
    let model = clustering_model(&state.config)?;
    let similar = similar_books(
        &state.pool,
        &id,
        &model,
        params.limit.unwrap_or(DEFAULT_SIMILAR_LIMIT),
    )
    .await?;
    Ok(Json(serde_json::json!({ "book_id": id, "similar": similar })))
}

async fn handle_cluster_books(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Value> {
    let books = books_in_cluster(&state.pool, id).await?;
    if books.is_empty() {
        return Err(app_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no books in cluster {}", id),
        ));
    }
    Ok(Json(serde_json::json!({ "cluster_id": id, "books": books })))
}

async fn handle_exemplars(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Value> {
    let clusters = all_exemplars(&state.pool, params.limit.unwrap_or(DEFAULT_EXEMPLARS)).await?;
    Ok(Json(serde_json::json!({ "clusters": clusters })))
}

async fn handle_reset(State(state): State<AppState>) -> ApiResult<Value> {
    migrate::reset(&state.pool).await?;
    tracing::warn!("database reset");
    Ok(Json(serde_json::json!({ "status": "reset" })))
}
