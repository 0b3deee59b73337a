//! MCP-style HTTP tool surface.
//!
//! Each tool is a thin adapter over the retrieval and store APIs:
//! `qmd_search`, `qmd_vector_search`, `qmd_deep_search`, `qmd_get`,
//! `qmd_multi_get`, `qmd_status`, plus a `/health` probe. Errors follow
//! one JSON shape: `{"error": {"code", "message"}}`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::QmdError;
use crate::get::{resolve_fileref, run_multi_get, slice_lines, GetOptions};
use crate::search::{run_query, run_search, run_vsearch, QueryOptions};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Serve the tool surface until the process is terminated.
pub async fn run_server(engine: Arc<Engine>, bind: &str) -> anyhow::Result<()> {
    let state = AppState { engine };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/qmd_search", post(handle_search))
        .route("/tools/qmd_vector_search", post(handle_vector_search))
        .route("/tools/qmd_deep_search", post(handle_deep_search))
        .route("/tools/qmd_get", post(handle_get))
        .route("/tools/qmd_multi_get", post(handle_multi_get))
        .route("/tools/qmd_status", post(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind, "mcp server listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<QmdError> for AppError {
    fn from(err: QmdError) -> Self {
        let (status, code) = match &err {
            QmdError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            QmdError::Usage(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            QmdError::VectorUnavailable => (StatusCode::BAD_REQUEST, "vector_unavailable"),
            QmdError::DimensionMismatch { .. } => {
                (StatusCode::CONFLICT, "dimension_mismatch")
            }
            QmdError::CoolingDown { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "provider_cooling_down")
            }
            QmdError::Provider { .. } => (StatusCode::BAD_GATEWAY, "provider_error"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    collections: Vec<String>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(body): Json<SearchBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let results = run_search(
        &state.engine,
        &body.query,
        body.limit.unwrap_or(10),
        &body.collections,
    )
    .await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
struct VectorSearchBody {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    min_score: Option<f64>,
    #[serde(default)]
    collections: Vec<String>,
}

async fn handle_vector_search(
    State(state): State<AppState>,
    Json(body): Json<VectorSearchBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let results = run_vsearch(
        &state.engine,
        &body.query,
        body.limit.unwrap_or(10),
        body.min_score.unwrap_or(0.3),
        &body.collections,
    )
    .await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
struct DeepSearchBody {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    min_score: Option<f64>,
    #[serde(default)]
    collections: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

async fn handle_deep_search(
    State(state): State<AppState>,
    Json(body): Json<DeepSearchBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let opts = QueryOptions {
        limit: body.limit.unwrap_or(10),
        min_score: body.min_score.unwrap_or(0.0),
        collections: body.collections,
        context: body.context,
        ..QueryOptions::default()
    };
    let results = run_query(&state.engine, &body.query, &opts).await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[derive(Deserialize)]
struct GetBody {
    file: String,
    #[serde(default)]
    from: Option<usize>,
    #[serde(default)]
    lines: Option<usize>,
    #[serde(default)]
    line_numbers: bool,
}

async fn handle_get(
    State(state): State<AppState>,
    Json(body): Json<GetBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let file = resolve_fileref(&state.engine, &body.file).await?;
    let opts = GetOptions {
        from_line: body.from,
        line_count: body.lines,
        line_numbers: body.line_numbers,
    };
    let content = slice_lines(&file.body, &opts);
    Ok(Json(serde_json::json!({
        "file": format!("qmd://{}/{}", file.collection, file.path),
        "title": file.title,
        "docid": file.docid,
        "content": content,
    })))
}

#[derive(Deserialize)]
struct MultiGetBody {
    pattern: String,
    #[serde(default)]
    max_bytes: Option<u64>,
}

async fn handle_multi_get(
    State(state): State<AppState>,
    Json(body): Json<MultiGetBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let files = run_multi_get(&state.engine, &body.pattern, body.max_bytes).await?;
    Ok(Json(serde_json::json!({ "documents": files })))
}

async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let health = state.engine.store.index_health().await?;
    let vectors = state.engine.store.count_vectors().await?;
    let providers: serde_json::Map<String, serde_json::Value> = state
        .engine
        .gateway
        .provider_summary()
        .into_iter()
        .map(|(op, provider)| {
            (
                op.to_string(),
                provider
                    .map(|p| serde_json::Value::String(p.to_string()))
                    .unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    Ok(Json(serde_json::json!({
        "health": health,
        "vectors": vectors,
        "collections": state.engine.registry.collections().len(),
        "providers": providers,
    })))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}
