//! Top-level knowledge loader: selection → per-layer loading → assembly,
//! under the full-request deadline, with every failure folded into the
//! returned [`LoadResult`].

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kb_events::{Event, EventBus, EventKind};

use crate::breaker::CircuitBreaker;
use crate::cache::{CacheStatsSnapshot, ContentCache};
use crate::capability::{CapabilityDispatcher, CapabilityRegistry};
use crate::config::RuntimeConfig;
use crate::context::{CancelToken, CorrelationId, RequestContext};
use crate::defaults;
use crate::error::LoadError;
use crate::fallback::FallbackProvider;
use crate::fingerprint::estimate_tokens;
use crate::index::{IndexSnapshot, KnowledgeIndex, LayerId};
use crate::layer::{FileFailure, LayerLoader, ServedFrom};
use crate::select::{Selection, Selector, SkipReason};
use crate::source::{ContentSource, FsSource};
use crate::timeout::{TimeoutLevel, Timeouts};

/// One load request. At least one of `task` / `layers` must be present;
/// `layers` may be `["*"]` to request every indexed layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoadRequest {
    pub task: Option<String>,
    pub layers: Option<Vec<String>>,
    pub token_budget: Option<u64>,
    pub timeout_override_ms: Option<u64>,
    /// Caller-supplied correlation id; generated when absent.
    pub correlation_id: Option<String>,
}

impl LoadRequest {
    fn effective_task(&self) -> Option<&str> {
        self.task
            .as_deref()
            .map(str::trim)
            .filter(|task| !task.is_empty())
    }

    fn effective_layers(&self) -> Option<&[String]> {
        self.layers
            .as_deref()
            .filter(|layers| !layers.is_empty())
    }
}

/// Aggregate outcome of a load, from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Every admitted layer was served fresh (filesystem or fresh cache).
    Success,
    /// At least one layer was skipped for budget, deadline, or cancellation.
    Partial,
    /// At least one piece of content came from the fallback ladder.
    Fallback,
    /// The overall deadline elapsed before any layer was served fresh.
    Timeout,
    /// Every admitted layer was substituted because the breaker was open.
    CircuitOpen,
}

impl LoadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStatus::Success => "success",
            LoadStatus::Partial => "partial",
            LoadStatus::Fallback => "fallback",
            LoadStatus::Timeout => "timeout",
            LoadStatus::CircuitOpen => "circuit_open",
        }
    }
}

/// One degradation notice. `layer`/`file` narrow the scope when known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub reason: String,
}

impl Warning {
    fn layer_scoped(layer: &str, reason: impl Into<String>) -> Self {
        Self {
            layer: Some(layer.to_string()),
            file: None,
            reason: reason.into(),
        }
    }

    fn file_scoped(layer: &str, file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            layer: Some(layer.to_string()),
            file: Some(file.into()),
            reason: reason.into(),
        }
    }

    fn global(reason: impl Into<String>) -> Self {
        Self {
            layer: None,
            file: None,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.layer, &self.file) {
            (Some(layer), Some(file)) => write!(f, "{}: {layer}/{file}", self.reason),
            (Some(layer), None) => write!(f, "{}: {layer}", self.reason),
            _ => f.write_str(&self.reason),
        }
    }
}

/// What a load produced. The read path always returns one of these; see
/// [`LoadError`] for the only rejected case.
#[derive(Debug, Clone, Serialize)]
pub struct LoadResult {
    pub content: String,
    pub status: LoadStatus,
    pub layers_loaded: Vec<String>,
    pub layers_requested: Vec<String>,
    pub duration_ms: u64,
    pub approximate_tokens: u64,
    pub warnings: Vec<Warning>,
    pub correlation_id: String,
}

#[derive(Default)]
struct LoaderStats {
    loads: AtomicU64,
    successes: AtomicU64,
    partials: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
    circuit_open: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatsSnapshot {
    pub loads: u64,
    pub successes: u64,
    pub partials: u64,
    pub fallbacks: u64,
    pub timeouts: u64,
    pub circuit_open: u64,
    pub cache: CacheStatsSnapshot,
}

/// Builder mirroring the runtime's construction-time seams: config, event
/// bus, content source, and capability registry.
pub struct KnowledgeLoaderBuilder {
    config: RuntimeConfig,
    bus: Option<EventBus>,
    source: Option<Arc<dyn ContentSource>>,
    registry: CapabilityRegistry,
}

impl KnowledgeLoaderBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn content_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.content_root = root.into();
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn content_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn capabilities(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Scans the content root and assembles the runtime.
    pub async fn build(self) -> KnowledgeLoader {
        let config = self.config;
        let bus = if config.events_enabled {
            self.bus.unwrap_or_default()
        } else {
            EventBus::disabled()
        };
        let timeouts = Timeouts::from_settings(&config.timeouts);
        let source = self.source.unwrap_or_else(|| Arc::new(FsSource));
        let cache = Arc::new(ContentCache::new(&config.cache, source, bus.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            defaults::CONTENT_BREAKER_SCOPE,
            config.breaker,
            bus.clone(),
        ));
        let fallback = Arc::new(FallbackProvider::new(Arc::clone(&cache)));
        let (selector, selector_warnings) = Selector::from_settings(&config.loading);
        for warning in &selector_warnings {
            warn!(%warning, "selector configuration");
        }
        let index = KnowledgeIndex::bootstrap(config.content_root.clone()).await;
        let dispatcher =
            CapabilityDispatcher::new(self.registry, config.breaker, timeouts, bus.clone());
        KnowledgeLoader {
            timeouts,
            selector,
            index,
            cache: Arc::clone(&cache),
            layer_loader: LayerLoader::new(
                cache,
                breaker,
                Arc::clone(&fallback),
                timeouts,
            ),
            fallback,
            dispatcher,
            bus,
            stats: LoaderStats::default(),
        }
    }
}

/// The facade. One instance serves concurrent requests; see the crate docs
/// for the degradation contract.
pub struct KnowledgeLoader {
    timeouts: Timeouts,
    selector: Selector,
    index: KnowledgeIndex,
    cache: Arc<ContentCache>,
    layer_loader: LayerLoader,
    fallback: Arc<FallbackProvider>,
    dispatcher: CapabilityDispatcher,
    bus: EventBus,
    stats: LoaderStats,
}

impl KnowledgeLoader {
    pub fn builder() -> KnowledgeLoaderBuilder {
        KnowledgeLoaderBuilder {
            config: RuntimeConfig::default(),
            bus: None,
            source: None,
            registry: CapabilityRegistry::new(),
        }
    }

    pub fn index(&self) -> &KnowledgeIndex {
        &self.index
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn capabilities(&self) -> &CapabilityDispatcher {
        &self.dispatcher
    }

    pub(crate) fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub(crate) fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn stats(&self) -> LoaderStatsSnapshot {
        LoaderStatsSnapshot {
            loads: self.stats.loads.load(Ordering::Relaxed),
            successes: self.stats.successes.load(Ordering::Relaxed),
            partials: self.stats.partials.load(Ordering::Relaxed),
            fallbacks: self.stats.fallbacks.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            circuit_open: self.stats.circuit_open.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    /// Loads under a fresh context (deadline T4, new correlation id unless
    /// the request carries one).
    pub async fn load(&self, request: LoadRequest) -> Result<LoadResult, LoadError> {
        let correlation = request
            .correlation_id
            .clone()
            .map(CorrelationId::from_string)
            .unwrap_or_else(CorrelationId::generate);
        let ctx = RequestContext::with_parts(None, correlation, CancelToken::new());
        self.load_with_context(request, &ctx).await
    }

    /// Loads under a caller-provided context, inheriting its cancellation
    /// token and tightening its deadline with T4 (or the request override).
    pub async fn load_with_context(
        &self,
        request: LoadRequest,
        ctx: &RequestContext,
    ) -> Result<LoadResult, LoadError> {
        let task = request.effective_task();
        let explicit = request.effective_layers();
        if task.is_none() && explicit.is_none() {
            return Err(LoadError::bad_request(
                "request must include a task or explicit layers",
            ));
        }

        let deadline =
            self.timeouts
                .deadline(TimeoutLevel::Full, request.timeout_override_ms, ctx.deadline());
        let ctx = ctx.child(deadline);
        let started = tokio::time::Instant::now();

        self.bus.publish(
            Event::new(EventKind::LoadStart, ctx.correlation().as_str())
                .with_field("task", task.unwrap_or_default())
                .with_field(
                    "explicit_layers",
                    explicit.map(|layers| layers.join(",")).unwrap_or_default(),
                ),
        );

        let snapshot = self.index.snapshot();
        let selection = self
            .selector
            .select(task, explicit, request.token_budget, &snapshot);
        let assembly = self.run_layers(&selection, &snapshot, &ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = self.compose(selection, assembly, duration_ms, &ctx);
        self.count(result.status);
        self.bus.publish(
            Event::new(EventKind::LoadComplete, ctx.correlation().as_str())
                .with_field("status", result.status.as_str())
                .with_field("duration_ms", result.duration_ms)
                .with_field("layers_loaded", result.layers_loaded.len() as u64)
                .with_field("warnings", result.warnings.len() as u64),
        );
        Ok(result)
    }

    async fn run_layers(
        &self,
        selection: &Selection,
        snapshot: &IndexSnapshot,
        ctx: &RequestContext,
    ) -> LayerAssembly {
        let mut assembly = LayerAssembly::default();

        for (position, layer) in selection.admitted.iter().enumerate() {
            if ctx.is_cancelled() {
                assembly.cancelled = true;
                assembly.mark_remaining(&selection.admitted[position..], "skipped:cancelled");
                break;
            }
            if ctx.deadline_elapsed() {
                assembly.deadline_truncated = true;
                assembly.mark_remaining(&selection.admitted[position..], SkipReason::Deadline.as_str());
                break;
            }

            self.bus.publish(
                Event::new(EventKind::LoadLayerStart, ctx.correlation().as_str())
                    .with_field("layer", layer.as_str()),
            );
            let layer_deadline = self
                .timeouts
                .deadline(TimeoutLevel::Layer, None, ctx.deadline());
            let layer_ctx = ctx.child(layer_deadline);
            let content = self.layer_loader.load_layer(snapshot, layer, &layer_ctx).await;

            let files = snapshot.files(layer);
            if ctx.is_cancelled() {
                // Whatever this layer managed to read is discarded; the
                // result reflects completed layers only.
                assembly.cancelled = true;
                assembly.mark_remaining(&selection.admitted[position..], "skipped:cancelled");
                break;
            }
            if content.files.len() < files.len() {
                if ctx.deadline_elapsed() {
                    // Out of budget for the whole request: the cut-short
                    // layer and everything after it are abandoned.
                    assembly.deadline_truncated = true;
                    assembly.mark_remaining(
                        &selection.admitted[position..],
                        SkipReason::Deadline.as_str(),
                    );
                    break;
                }
                // Only the layer deadline elapsed: substitute whole-layer
                // fallback content and keep going.
                let (text, tier) = self.fallback.layer_fallback(layer, &files, &layer_ctx);
                self.bus.publish(
                    Event::new(EventKind::LoadLayerTimeout, ctx.correlation().as_str())
                        .with_field("layer", layer.as_str()),
                );
                self.bus.publish(
                    Event::new(EventKind::LoadLayerFallback, ctx.correlation().as_str())
                        .with_field("layer", layer.as_str())
                        .with_field("tier", tier.as_str()),
                );
                assembly.any_fallback = true;
                assembly.any_layer_not_circuit_open = true;
                assembly
                    .warnings
                    .push(Warning::layer_scoped(layer.as_str(), "timeout"));
                assembly.tokens += estimate_tokens(text.len() as u64);
                assembly.loaded.push(layer.as_str().to_string());
                if !text.is_empty() {
                    assembly.blocks.push(text);
                }
                continue;
            }

            let mut layer_timeout = false;
            let mut layer_fallback = false;
            for file in &content.files {
                let file_label = file
                    .path
                    .strip_prefix(&format!("{}/", layer.as_str()))
                    .unwrap_or(&file.path)
                    .to_string();
                match file.failure {
                    Some(failure) => {
                        if failure == FileFailure::Timeout {
                            layer_timeout = true;
                        }
                        assembly.warnings.push(Warning::file_scoped(
                            layer.as_str(),
                            file_label,
                            failure.as_str(),
                        ));
                    }
                    None if file.served == ServedFrom::CacheStale => {
                        assembly.warnings.push(Warning::file_scoped(
                            layer.as_str(),
                            file_label,
                            "stale",
                        ));
                    }
                    None => {}
                }
                if file.served.is_fallback() {
                    layer_fallback = true;
                }
            }

            if layer_timeout {
                self.bus.publish(
                    Event::new(EventKind::LoadLayerTimeout, ctx.correlation().as_str())
                        .with_field("layer", layer.as_str()),
                );
            }
            if layer_fallback {
                assembly.any_fallback = true;
                self.bus.publish(
                    Event::new(EventKind::LoadLayerFallback, ctx.correlation().as_str())
                        .with_field("layer", layer.as_str()),
                );
            } else {
                self.bus.publish(
                    Event::new(EventKind::LoadLayerComplete, ctx.correlation().as_str())
                        .with_field("layer", layer.as_str())
                        .with_field("tokens", content.token_estimate),
                );
            }

            if content.fully_fresh() {
                assembly.fresh_layers += 1;
            }
            if !content.entirely_circuit_open() {
                assembly.any_layer_not_circuit_open = true;
            }
            debug!(
                layer = layer.as_str(),
                files = content.files.len(),
                tokens = content.token_estimate,
                "layer assembled"
            );
            assembly.tokens += content.token_estimate;
            assembly.loaded.push(layer.as_str().to_string());
            if !content.text.is_empty() {
                assembly.blocks.push(content.text);
            }
        }
        assembly
    }

    fn compose(
        &self,
        selection: Selection,
        assembly: LayerAssembly,
        duration_ms: u64,
        ctx: &RequestContext,
    ) -> LoadResult {
        let mut warnings = assembly.warnings;
        for name in &selection.unknown {
            warnings.push(Warning::layer_scoped(name, "unknown_layer"));
        }
        for (layer, reason) in &selection.skipped {
            warnings.push(Warning::layer_scoped(layer.as_str(), reason.as_str()));
        }
        if assembly.cancelled {
            warnings.push(Warning::global("cancelled"));
        }

        let mut layers_requested: Vec<String> = selection
            .admitted
            .iter()
            .map(|layer| layer.as_str().to_string())
            .collect();
        layers_requested.extend(
            selection
                .skipped
                .iter()
                .map(|(layer, _)| layer.as_str().to_string()),
        );

        let any_skipped =
            !selection.skipped.is_empty() || !assembly.skipped.is_empty() || assembly.cancelled;

        let status = if !assembly.loaded.is_empty() && !assembly.any_layer_not_circuit_open {
            LoadStatus::CircuitOpen
        } else if assembly.deadline_truncated && assembly.fresh_layers == 0 {
            LoadStatus::Timeout
        } else if assembly.any_fallback {
            LoadStatus::Fallback
        } else if any_skipped {
            LoadStatus::Partial
        } else {
            LoadStatus::Success
        };

        for (layer, reason) in &assembly.skipped {
            warnings.push(Warning::layer_scoped(layer, reason));
        }

        LoadResult {
            content: assembly.blocks.join("\n\n"),
            status,
            layers_loaded: assembly.loaded,
            layers_requested,
            duration_ms,
            approximate_tokens: assembly.tokens,
            warnings,
            correlation_id: ctx.correlation().as_str().to_string(),
        }
    }

    fn count(&self, status: LoadStatus) {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            LoadStatus::Success => &self.stats.successes,
            LoadStatus::Partial => &self.stats.partials,
            LoadStatus::Fallback => &self.stats.fallbacks,
            LoadStatus::Timeout => &self.stats.timeouts,
            LoadStatus::CircuitOpen => &self.stats.circuit_open,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct LayerAssembly {
    blocks: Vec<String>,
    loaded: Vec<String>,
    warnings: Vec<Warning>,
    /// Layers abandoned mid-flight, with their skip reason.
    skipped: Vec<(String, String)>,
    tokens: u64,
    fresh_layers: u64,
    any_fallback: bool,
    /// False only while every loaded layer was entirely breaker-substituted.
    any_layer_not_circuit_open: bool,
    deadline_truncated: bool,
    cancelled: bool,
}

impl LayerAssembly {
    fn mark_remaining(&mut self, remaining: &[LayerId], reason: &str) {
        for layer in remaining {
            self.skipped
                .push((layer.as_str().to_string(), reason.to_string()));
        }
    }
}
