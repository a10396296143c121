//! Contract surface for an MCP (Model-Context-Protocol) server.
//!
//! This module is deliberately transport-free: it defines the tool names,
//! their serde parameter/result shapes, and [`handle_tool_call`], which maps
//! a tool invocation onto the loader. The JSON-RPC loop, stdio framing, and
//! process lifecycle belong to the embedding server, not the runtime.
//!
//! Tools:
//! - `get_knowledge` — the full selector-driven load; mirrors
//!   [`LoadRequest`].
//! - `get_layer` — one explicit layer, no trigger evaluation.
//! - `search` — case-insensitive content search over the index.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::LoadError;
use crate::loader::{KnowledgeLoader, LoadRequest, LoadResult, LoadStatus, Warning};
use crate::search::SearchMatch;

/// Tool name for the selector-driven load.
pub const TOOL_GET_KNOWLEDGE: &str = "get_knowledge";
/// Tool name for a single explicit layer.
pub const TOOL_GET_LAYER: &str = "get_layer";
/// Tool name for content search.
pub const TOOL_SEARCH: &str = "search";

/// Every tool this surface exposes.
pub const TOOLS: [&str; 3] = [TOOL_GET_KNOWLEDGE, TOOL_GET_LAYER, TOOL_SEARCH];

/// Parameters for `get_knowledge`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetKnowledgeParams {
    pub task: Option<String>,
    pub layers: Option<Vec<String>>,
    pub token_budget: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub correlation_id: Option<String>,
}

/// Parameters for `get_layer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLayerParams {
    pub layer: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Parameters for `search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    50
}

/// Structured result for the content tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    pub status: LoadStatus,
    pub warnings: Vec<Warning>,
    pub correlation_id: String,
}

impl From<LoadResult> for ToolResponse {
    fn from(result: LoadResult) -> Self {
        Self {
            content: result.content,
            status: result.status,
            warnings: result.warnings,
            correlation_id: result.correlation_id,
        }
    }
}

/// Structured result for `search`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub matches: Vec<SearchMatch>,
}

/// Errors surfaced to the MCP transport. `UnknownTool` and `Params` map to
/// JSON-RPC invalid-request codes; `BadRequest` carries the loader's typed
/// rejection.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("unknown tool `{name}`")]
    UnknownTool { name: String },
    #[error("invalid params: {0}")]
    Params(#[from] serde_json::Error),
    #[error(transparent)]
    BadRequest(#[from] LoadError),
}

/// Dispatches one tool call and returns its JSON result. This is the whole
/// adapter: anything beyond field mapping belongs in the core.
pub async fn handle_tool_call(
    loader: &KnowledgeLoader,
    tool: &str,
    params: Value,
) -> Result<Value, McpError> {
    match tool {
        TOOL_GET_KNOWLEDGE => {
            let params: GetKnowledgeParams = serde_json::from_value(params)?;
            let result = loader
                .load(LoadRequest {
                    task: params.task,
                    layers: params.layers,
                    token_budget: params.token_budget,
                    timeout_override_ms: params.timeout_ms,
                    correlation_id: params.correlation_id,
                })
                .await?;
            Ok(serde_json::to_value(ToolResponse::from(result))?)
        }
        TOOL_GET_LAYER => {
            let params: GetLayerParams = serde_json::from_value(params)?;
            let result = loader
                .load(LoadRequest {
                    layers: Some(vec![params.layer]),
                    timeout_override_ms: params.timeout_ms,
                    ..LoadRequest::default()
                })
                .await?;
            Ok(serde_json::to_value(ToolResponse::from(result))?)
        }
        TOOL_SEARCH => {
            let params: SearchParams = serde_json::from_value(params)?;
            let matches = loader.search(&params.query, params.limit).await;
            Ok(serde_json::to_value(SearchResponse { matches })?)
        }
        other => Err(McpError::UnknownTool {
            name: other.to_string(),
        }),
    }
}
