//! Two-tier content cache: hot in-memory LRU plus optional warm on-disk
//! tier, keyed by `(relative path, fingerprint)`.
//!
//! Freshness is three-phased per entry: *fresh* within `ttl_ms` of
//! insertion, *stale* (servable, refresh-worthy) up to `stale_ms`, then
//! expired. Misses coalesce per key: under N concurrent misses the
//! underlying source is read exactly once and every caller observes the
//! same result or error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use kb_events::{Event, EventBus, EventKind};

use crate::config::CacheSettings;
use crate::context::{CorrelationId, RequestContext};
use crate::fingerprint::{estimate_tokens, Fingerprint};
use crate::index::FileRef;
use crate::source::ContentSource;
use crate::warm::WarmTier;

/// Cache key: forward-slash path relative to the content root, plus the
/// indexed content fingerprint. A changed file gets a new fingerprint and
/// therefore a clean miss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn for_file(file: &FileRef) -> Self {
        Self {
            path: file.relative_path.clone(),
            fingerprint: file.fingerprint,
        }
    }
}

/// Content of one file plus its token estimate. Clones share the bytes.
#[derive(Debug, Clone)]
pub struct ContentBlob {
    pub file: FileRef,
    pub bytes: Arc<[u8]>,
    pub token_estimate: u64,
}

impl ContentBlob {
    fn new(file: FileRef, bytes: Vec<u8>) -> Self {
        let token_estimate = estimate_tokens(bytes.len() as u64);
        Self {
            file,
            bytes: bytes.into(),
            token_estimate,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Hot-tier lookup result.
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    /// Within the TTL horizon; serve as-is.
    Fresh(ContentBlob),
    /// Past TTL but within the serve-stale window; serve immediately, then
    /// consider [`ContentCache::spawn_refresh`].
    Stale(ContentBlob),
    Miss,
}

/// Read failure surfaced by [`ContentCache::read_through`]. Cloneable so a
/// single-flight leader's error reaches every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to read `{path}`: {message}")]
pub struct ReadError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct HotEntry {
    blob: ContentBlob,
    inserted_at: Instant,
}

struct HotTier {
    entries: LruCache<CacheKey, HotEntry>,
    total_bytes: usize,
}

struct Flight {
    cell: tokio::sync::OnceCell<Result<ContentBlob, ReadError>>,
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

pub struct ContentCache {
    hot: Mutex<HotTier>,
    max_entries: usize,
    max_bytes: usize,
    ttl: Duration,
    stale: Duration,
    warm: Option<WarmTier>,
    flights: Mutex<HashMap<CacheKey, Arc<Flight>>>,
    source: Arc<dyn ContentSource>,
    bus: EventBus,
    counters: CacheCounters,
}

impl ContentCache {
    pub fn new(settings: &CacheSettings, source: Arc<dyn ContentSource>, bus: EventBus) -> Self {
        Self {
            hot: Mutex::new(HotTier {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            max_entries: settings.max_entries,
            max_bytes: settings.max_bytes,
            ttl: Duration::from_millis(settings.ttl_ms),
            stale: Duration::from_millis(settings.stale_ms),
            warm: settings.warm_dir.clone().map(WarmTier::new),
            flights: Mutex::new(HashMap::new()),
            source,
            bus,
            counters: CacheCounters::default(),
        }
    }

    /// Hot-tier lookup. Emits `cache.hit`, `cache.stale_hit`, or
    /// `cache.miss`; expired entries are dropped on sight.
    pub fn lookup(&self, file: &FileRef, ctx: &RequestContext) -> CacheOutcome {
        let key = CacheKey::for_file(file);
        let now = Instant::now();
        let mut hot = self.hot.lock().expect("hot tier poisoned");
        let mut expired = false;
        let outcome = match hot.entries.get(&key) {
            Some(entry) => {
                let age = now.saturating_duration_since(entry.inserted_at);
                if age <= self.ttl {
                    CacheOutcome::Fresh(entry.blob.clone())
                } else if age <= self.stale {
                    CacheOutcome::Stale(entry.blob.clone())
                } else {
                    expired = true;
                    CacheOutcome::Miss
                }
            }
            None => CacheOutcome::Miss,
        };
        if expired {
            if let Some(evicted) = hot.entries.pop(&key) {
                hot.total_bytes = hot.total_bytes.saturating_sub(evicted.blob.bytes.len());
            }
        }
        drop(hot);

        let (kind, counter) = match &outcome {
            CacheOutcome::Fresh(_) => (EventKind::CacheHit, &self.counters.hits),
            CacheOutcome::Stale(_) => (EventKind::CacheStaleHit, &self.counters.stale_hits),
            CacheOutcome::Miss => (EventKind::CacheMiss, &self.counters.misses),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            Event::new(kind, ctx.correlation().as_str()).with_field("path", key.path.as_str()),
        );
        outcome
    }

    /// Stale-window view used by the fallback provider; does not count as a
    /// lookup but does announce itself when it serves.
    pub fn stale_blob(&self, file: &FileRef, ctx: &RequestContext) -> Option<ContentBlob> {
        let key = CacheKey::for_file(file);
        let now = Instant::now();
        let blob = {
            let mut hot = self.hot.lock().expect("hot tier poisoned");
            hot.entries.get(&key).and_then(|entry| {
                let age = now.saturating_duration_since(entry.inserted_at);
                (age <= self.stale).then(|| entry.blob.clone())
            })
        }?;
        self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
        self.bus.publish(
            Event::new(EventKind::CacheStaleHit, ctx.correlation().as_str())
                .with_field("path", key.path.as_str()),
        );
        Some(blob)
    }

    /// Miss path: warm tier, then the content source, under single-flight
    /// coalescing per key. The result (or error) is shared by every caller
    /// that joined the flight.
    pub async fn read_through(
        &self,
        file: &FileRef,
        ctx: &RequestContext,
    ) -> Result<ContentBlob, ReadError> {
        let key = CacheKey::for_file(file);
        let flight = {
            let mut flights = self.flights.lock().expect("flight table poisoned");
            Arc::clone(flights.entry(key.clone()).or_insert_with(|| {
                Arc::new(Flight {
                    cell: tokio::sync::OnceCell::new(),
                })
            }))
        };
        let result = flight
            .cell
            .get_or_init(|| self.perform_read(file, ctx))
            .await
            .clone();
        let mut flights = self.flights.lock().expect("flight table poisoned");
        if let Some(current) = flights.get(&key) {
            if Arc::ptr_eq(current, &flight) {
                flights.remove(&key);
            }
        }
        result
    }

    async fn perform_read(&self, file: &FileRef, ctx: &RequestContext) -> Result<ContentBlob, ReadError> {
        // A completed leader may have populated the hot tier while this
        // caller was en route to the flight.
        if let Some(blob) = self.fresh_blob(file) {
            return Ok(blob);
        }
        if let Some(warm) = &self.warm {
            if let Some(bytes) = warm.get(&file.fingerprint).await {
                let blob = ContentBlob::new(file.clone(), bytes);
                self.insert(blob.clone(), ctx);
                return Ok(blob);
            }
        }
        let bytes = self
            .source
            .read(&file.absolute_path)
            .await
            .map_err(|error| ReadError {
                path: file.relative_path.clone(),
                message: error.to_string(),
            })?;
        let fingerprint = Fingerprint::of(&bytes);
        let blob = ContentBlob::new(file.clone(), bytes);
        self.insert(blob.clone(), ctx);
        if let Some(warm) = &self.warm {
            warm.put(&fingerprint, &blob.bytes).await;
        }
        Ok(blob)
    }

    fn fresh_blob(&self, file: &FileRef) -> Option<ContentBlob> {
        let key = CacheKey::for_file(file);
        let now = Instant::now();
        let mut hot = self.hot.lock().expect("hot tier poisoned");
        hot.entries.get(&key).and_then(|entry| {
            let age = now.saturating_duration_since(entry.inserted_at);
            (age <= self.ttl).then(|| entry.blob.clone())
        })
    }

    /// Kicks off an asynchronous refresh after a stale hit. At most one
    /// concurrent refresh per key; extra calls are no-ops while one runs.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        file: FileRef,
        correlation: CorrelationId,
        budget: Duration,
    ) {
        let key = CacheKey::for_file(&file);
        {
            let flights = self.flights.lock().expect("flight table poisoned");
            if flights.contains_key(&key) {
                return;
            }
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let ctx = RequestContext::with_parts(None, correlation, Default::default());
            // The stale entry stays resident until the re-read lands, so a
            // failed refresh keeps serving stale instead of going dark.
            match tokio::time::timeout(budget, cache.read_through(&file, &ctx)).await {
                Ok(Ok(_)) => {}
                Ok(Err(error)) => {
                    debug!(%error, path = %file.relative_path, "stale refresh failed")
                }
                Err(_) => debug!(path = %file.relative_path, "stale refresh timed out"),
            }
        });
    }

    fn insert(&self, blob: ContentBlob, ctx: &RequestContext) {
        let key = CacheKey::for_file(&blob.file);
        let added = blob.bytes.len();
        let mut hot = self.hot.lock().expect("hot tier poisoned");
        if let Some(previous) = hot.entries.put(
            key,
            HotEntry {
                blob,
                inserted_at: Instant::now(),
            },
        ) {
            hot.total_bytes = hot.total_bytes.saturating_sub(previous.blob.bytes.len());
        }
        hot.total_bytes += added;

        let mut evicted = Vec::new();
        while hot.entries.len() > self.max_entries || hot.total_bytes > self.max_bytes {
            let Some((key, entry)) = hot.entries.pop_lru() else {
                break;
            };
            hot.total_bytes = hot.total_bytes.saturating_sub(entry.blob.bytes.len());
            evicted.push(key.path);
        }
        drop(hot);

        for path in evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            self.bus.publish(
                Event::new(EventKind::CacheEvict, ctx.correlation().as_str())
                    .with_field("path", path),
            );
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.counters.hits.load(Ordering::Relaxed),
            stale_hits: self.counters.stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}
