#![forbid(unsafe_code)]
//! Timeout-bounded, fault-tolerant loader for layered Markdown knowledge bases.
//!
//! The runtime assembles a bounded, task-relevant slice of a knowledge tree
//! (directories of `.md` files under a content root) and returns it within
//! hard latency budgets, degrading instead of failing: a load that hits
//! timeouts, I/O errors, or an open circuit still returns a [`LoadResult`]
//! describing exactly what was served and from where.
//!
//! ## Construction
//! Build a [`KnowledgeLoader`] from a [`RuntimeConfig`] (defaults ← TOML file
//! ← `KB_*` environment ← per-call overrides) and an [`EventBus`]:
//!
//! ```rust,no_run
//! use kb_runtime::{KnowledgeLoader, LoadRequest, RuntimeConfig};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (config, warnings) = RuntimeConfig::load(None)?;
//! for warning in &warnings {
//!     eprintln!("config: {warning}");
//! }
//! let loader = KnowledgeLoader::builder().config(config).build().await;
//! let result = loader
//!     .load(LoadRequest {
//!         task: Some("review the auth module".to_string()),
//!         token_budget: Some(4_000),
//!         ..LoadRequest::default()
//!     })
//!     .await?;
//! print!("{}", result.content);
//! # Ok(()) }
//! ```
//!
//! ## Degradation contract
//! The read path never surfaces I/O or transient failures as errors. Every
//! condition folds into [`LoadResult`] fields:
//! - per-file timeout or read error → fallback content + warning,
//! - open circuit → fallback without touching the filesystem,
//! - overall deadline → remaining layers `skipped:deadline`,
//! - cancellation → whatever was assembled plus a `cancelled` warning.
//!
//! Only an invalid request (neither task nor explicit layers) is rejected,
//! as [`LoadError::BadRequest`].
//!
//! ## Moving parts
//! - [`KnowledgeIndex`]: immutable snapshot of the content tree, replaced
//!   atomically on rescans.
//! - [`ContentCache`]: hot LRU + optional warm on-disk tier, fingerprint
//!   keyed, with TTL / serve-stale horizons and single-flight reads.
//! - [`CircuitBreaker`]: named per-scope three-state guard (`io.content`,
//!   `capability.<family>`).
//! - [`Timeouts`]: the five named deadlines T1..T5 (cache, file, layer,
//!   full request, complex analysis), composable with a parent deadline.
//! - [`FallbackProvider`]: fresh → stale cache → packaged default →
//!   emergency string.
//! - [`CapabilityDispatcher`]: `(family, name)`-keyed registry run under the
//!   same deadline and breaker discipline.
//! - Every stage boundary emits a [`kb_events::Event`]; see the `kb_events`
//!   crate for delivery semantics.
//!
//! Adapter contracts live in [`mcp`] (tool shapes for an MCP server) and, as
//! an opt-in `http` feature, [`http`] (an axum router for `POST /load`).

mod breaker;
mod cache;
mod config;
mod context;
mod defaults;
mod error;
mod fallback;
mod fingerprint;
mod index;
mod layer;
mod loader;
mod search;
mod select;
mod source;
mod timeout;
mod warm;

pub mod capability;
#[cfg(feature = "http")]
pub mod http;
pub mod mcp;

pub use breaker::{BreakerError, BreakerState, CircuitBreaker};
pub use cache::{CacheKey, CacheOutcome, CacheStatsSnapshot, ContentBlob, ContentCache, ReadError};
pub use config::{
    BreakerSettings, CacheSettings, ConfigError, ConfigWarning, LoadingSettings, RuntimeConfig,
    TimeoutSettings, TriggerPriority, TriggerRule,
};
pub use context::{CancelToken, CorrelationId, Deadline, RequestContext};
pub use error::LoadError;
pub use fallback::{FallbackProvider, FallbackTier};
pub use fingerprint::{estimate_tokens, Fingerprint};
pub use index::{FileRef, IndexSnapshot, KnowledgeIndex, LayerId};
pub use layer::{FileFailure, FileStatus, LayerContent, ServedFrom};
pub use loader::{
    KnowledgeLoader, KnowledgeLoaderBuilder, LoadRequest, LoadResult, LoadStatus,
    LoaderStatsSnapshot, Warning,
};
pub use search::SearchMatch;
pub use select::{Selection, Selector, SkipReason};
pub use source::{ContentSource, FsSource, SourceFuture};
pub use timeout::{DeadlineExceeded, TimeoutLevel, Timeouts};

pub use kb_events::{Event, EventBus, EventKind, Subscription};

#[cfg(test)]
mod tests;
