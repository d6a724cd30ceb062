//! JSON-RPC 2.0 HTTP API.
//!
//! | Method | Path | RPC method |
//! |--------|------|------------|
//! | `POST` | `/api/v1/query` | `semantic_query` |
//! | `POST` | `/api/v1/get_doc` | `get_document` |
//! | `POST` | `/api/v1/find_concept` | `find_by_concept` |
//! | `GET`  | `/health` | — |
//!
//! # Error codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | `-32700` | request body is not valid JSON |
//! | `-32600` | body exceeds the 1 MiB cap |
//! | `-32601` | unknown RPC method for the endpoint |
//! | `-32004` | document not found |
//! | `-32603` | internal error |
//!
//! The server shuts down gracefully on ctrl-c / SIGTERM delivered as an
//! interrupt to the runtime.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::search::{self, SearchMode, SearchOptions};
use crate::store::{self, ContentOptions};

/// Maximum accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    pool: SqlitePool,
    config: Arc<Config>,
}

/// Start the API server and block until shutdown.
pub async fn run_server(
    pool: SqlitePool,
    config: Config,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let state = AppState {
        pool,
        config: Arc::new(config),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/query", post(handle_query))
        .route("/api/v1/get_doc", post(handle_get_doc))
        .route("/api/v1/find_concept", post(handle_find_concept))
        .route("/health", get(handle_health))
        // Accept slightly more than the cap so the JSON-RPC error is ours.
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES * 2))
        .layer(cors)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    tracing::info!("API server listening on http://{host}:{port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            crate::watcher::shutdown_signal().await;
            tracing::info!("shutdown signal received, stopping API server");
        })
        .await?;
    Ok(())
}

fn rpc_success(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "result": result, "id": id })
}

fn rpc_error(id: &Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "error": { "code": code, "message": message }, "id": id })
}

struct RpcCall {
    id: Value,
    params: Value,
}

/// Validate size, JSON shape, and method name of a JSON-RPC request body.
fn parse_rpc(body: &[u8], expected_method: &str) -> std::result::Result<RpcCall, Response> {
    if body.len() > MAX_BODY_BYTES {
        let payload = rpc_error(&Value::Null, -32600, "request body too large");
        return Err((StatusCode::PAYLOAD_TOO_LARGE, Json(payload)).into_response());
    }

    let request: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => {
            let payload = rpc_error(&Value::Null, -32700, "invalid json");
            return Err((StatusCode::BAD_REQUEST, Json(payload)).into_response());
        }
    };

    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(|m| m.as_str());
    if method != Some(expected_method) {
        let payload = rpc_error(&id, -32601, "method not found");
        return Err((StatusCode::NOT_FOUND, Json(payload)).into_response());
    }

    Ok(RpcCall {
        id,
        params: request.get("params").cloned().unwrap_or(json!({})),
    })
}

fn internal(id: &Value, err: &KeeperError) -> Response {
    let payload = rpc_error(id, -32603, &err.to_string());
    (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
}

// ============ POST /api/v1/query ============

#[derive(Deserialize)]
struct QueryParams {
    #[serde(default)]
    query: String,
    #[serde(default = "default_max_results")]
    max_results: i64,
    #[serde(default)]
    include_content: bool,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    section: Option<String>,
}

fn default_max_results() -> i64 {
    10
}

async fn query_result(pool: &SqlitePool, config: &Config, params: QueryParams) -> Result<Value> {
    let options = SearchOptions {
        mode: SearchMode::Semantic,
        limit: params.max_results.max(1),
        include_content: params.include_content,
        max_tokens: params.max_tokens,
        section: params.section,
    };
    let results = search::search(pool, config, &params.query, &options).await?;
    Ok(json!({
        "query": params.query,
        "count": results.len(),
        "documents": results,
    }))
}

async fn handle_query(State(state): State<AppState>, body: Bytes) -> Response {
    let call = match parse_rpc(&body, "semantic_query") {
        Ok(call) => call,
        Err(response) => return response,
    };
    let params: QueryParams = match serde_json::from_value(call.params) {
        Ok(params) => params,
        Err(e) => {
            let payload = rpc_error(&call.id, -32602, &format!("invalid params: {e}"));
            return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
        }
    };

    match query_result(&state.pool, &state.config, params).await {
        Ok(result) => Json(rpc_success(&call.id, result)).into_response(),
        Err(err) => internal(&call.id, &err),
    }
}

// ============ POST /api/v1/get_doc ============

#[derive(Deserialize)]
struct GetDocParams {
    document_id: i64,
    #[serde(default)]
    include_content: bool,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    section: Option<String>,
}

async fn handle_get_doc(State(state): State<AppState>, body: Bytes) -> Response {
    let call = match parse_rpc(&body, "get_document") {
        Ok(call) => call,
        Err(response) => return response,
    };
    let params: GetDocParams = match serde_json::from_value(call.params) {
        Ok(params) => params,
        Err(e) => {
            let payload = rpc_error(&call.id, -32602, &format!("invalid params: {e}"));
            return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
        }
    };

    let options = ContentOptions {
        include_content: params.include_content,
        max_tokens: params.max_tokens,
        section: params.section,
    };
    match store::get_document(&state.pool, params.document_id, &options).await {
        Ok(detail) => match serde_json::to_value(&detail) {
            Ok(value) => Json(rpc_success(&call.id, value)).into_response(),
            Err(e) => internal(&call.id, &KeeperError::Internal(e.to_string())),
        },
        Err(KeeperError::NotFound(_)) => {
            let payload = rpc_error(&call.id, -32004, "document not found");
            (StatusCode::NOT_FOUND, Json(payload)).into_response()
        }
        Err(err) => internal(&call.id, &err),
    }
}

// ============ POST /api/v1/find_concept ============

#[derive(Deserialize)]
struct ConceptParams {
    #[serde(default)]
    concept: String,
    #[serde(default = "default_max_results")]
    max_results: i64,
}

async fn handle_find_concept(State(state): State<AppState>, body: Bytes) -> Response {
    let call = match parse_rpc(&body, "find_by_concept") {
        Ok(call) => call,
        Err(response) => return response,
    };
    let params: ConceptParams = match serde_json::from_value(call.params) {
        Ok(params) => params,
        Err(e) => {
            let payload = rpc_error(&call.id, -32602, &format!("invalid params: {e}"));
            return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
        }
    };

    match store::find_by_concept(&state.pool, &params.concept, params.max_results.max(1)).await {
        Ok(documents) => {
            let result = json!({
                "concept": params.concept,
                "count": documents.len(),
                "documents": documents,
            });
            Json(rpc_success(&call.id, result)).into_response()
        }
        Err(err) => internal(&call.id, &err),
    }
}

// ============ GET /health ============

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
