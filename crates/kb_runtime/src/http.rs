//! HTTP adapter (feature `http`): a single `POST /load` route.
//!
//! Transport only. The handler maps the JSON body onto a [`LoadRequest`],
//! runs the loader, and mirrors the MCP response shape back. Any
//! non-bad-request outcome — including `timeout` and `circuit_open` — is a
//! 200 with the status in the body; only `BadRequest` is a 400. Server
//! lifecycle (bind, shutdown) belongs to the embedding binary.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;
use crate::loader::{KnowledgeLoader, LoadRequest, LoadResult, LoadStatus, Warning};

/// JSON body for `POST /load`; all fields optional, mirroring
/// [`LoadRequest`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoadBody {
    pub task: Option<String>,
    pub layers: Option<Vec<String>>,
    pub token_budget: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub correlation_id: Option<String>,
}

/// JSON response for `POST /load`.
#[derive(Debug, Clone, Serialize)]
pub struct LoadResponse {
    pub content: String,
    pub status: LoadStatus,
    pub layers_loaded: Vec<String>,
    pub layers_requested: Vec<String>,
    pub duration_ms: u64,
    pub approximate_tokens: u64,
    pub warnings: Vec<Warning>,
    pub correlation_id: String,
}

impl From<LoadResult> for LoadResponse {
    fn from(result: LoadResult) -> Self {
        Self {
            content: result.content,
            status: result.status,
            layers_loaded: result.layers_loaded,
            layers_requested: result.layers_requested,
            duration_ms: result.duration_ms,
            approximate_tokens: result.approximate_tokens,
            warnings: result.warnings,
            correlation_id: result.correlation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Builds the router. Mount it wherever the host binary serves.
pub fn router(loader: Arc<KnowledgeLoader>) -> Router {
    Router::new()
        .route("/load", post(load_handler))
        .with_state(loader)
}

async fn load_handler(
    State(loader): State<Arc<KnowledgeLoader>>,
    Json(body): Json<LoadBody>,
) -> Result<Json<LoadResponse>, (StatusCode, Json<ErrorBody>)> {
    let result = loader
        .load(LoadRequest {
            task: body.task,
            layers: body.layers,
            token_budget: body.token_budget,
            timeout_override_ms: body.timeout_ms,
            correlation_id: body.correlation_id,
        })
        .await;
    match result {
        Ok(result) => Ok(Json(LoadResponse::from(result))),
        Err(error @ LoadError::BadRequest { .. }) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
                error: error.to_string(),
            }),
        )),
        Err(error) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error: error.to_string(),
            }),
        )),
    }
}
