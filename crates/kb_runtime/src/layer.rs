//! Loads one layer: every admitted file, in lexicographic order, each read
//! through the cache and the `io.content` breaker under the file-level
//! deadline, with per-file fallback on any failure.

use std::sync::Arc;

use tracing::debug;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::cache::{CacheOutcome, ContentCache, ReadError};
use crate::context::RequestContext;
use crate::fallback::{FallbackProvider, FallbackTier};
use crate::fingerprint::estimate_tokens;
use crate::index::{FileRef, IndexSnapshot, LayerId};
use crate::timeout::{TimeoutLevel, Timeouts};

/// Where one file's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    FreshRead,
    CacheFresh,
    CacheStale,
    PackagedDefault,
    Emergency,
}

impl ServedFrom {
    pub fn is_fresh(&self) -> bool {
        matches!(self, ServedFrom::FreshRead | ServedFrom::CacheFresh)
    }

    pub fn is_fallback(&self) -> bool {
        !self.is_fresh()
    }

    fn from_tier(tier: FallbackTier) -> Self {
        match tier {
            FallbackTier::StaleCache => ServedFrom::CacheStale,
            FallbackTier::Packaged => ServedFrom::PackagedDefault,
            FallbackTier::Emergency => ServedFrom::Emergency,
        }
    }
}

/// Why a file needed fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFailure {
    Timeout,
    Io,
    CircuitOpen,
}

impl FileFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFailure::Timeout => "timeout",
            FileFailure::Io => "io",
            FileFailure::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStatus {
    /// Relative path within the content root.
    pub path: String,
    pub served: ServedFrom,
    pub failure: Option<FileFailure>,
}

/// Assembled content of one layer plus per-file provenance.
#[derive(Debug, Clone)]
pub struct LayerContent {
    pub layer: LayerId,
    pub text: String,
    pub token_estimate: u64,
    pub files: Vec<FileStatus>,
}

impl LayerContent {
    /// Every file served fresh (filesystem or fresh cache).
    pub fn fully_fresh(&self) -> bool {
        self.files.iter().all(|file| file.served.is_fresh())
    }

    pub fn any_fallback(&self) -> bool {
        self.files.iter().any(|file| file.served.is_fallback())
    }

    pub fn any_timeout(&self) -> bool {
        self.files
            .iter()
            .any(|file| file.failure == Some(FileFailure::Timeout))
    }

    /// Every file was rejected by the open breaker; nothing was read.
    pub fn entirely_circuit_open(&self) -> bool {
        !self.files.is_empty()
            && self
                .files
                .iter()
                .all(|file| file.failure == Some(FileFailure::CircuitOpen))
    }
}

enum FileReadError {
    Timeout,
    Read(ReadError),
}

pub(crate) struct LayerLoader {
    cache: Arc<ContentCache>,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<FallbackProvider>,
    timeouts: Timeouts,
}

impl LayerLoader {
    pub(crate) fn new(
        cache: Arc<ContentCache>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<FallbackProvider>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            cache,
            breaker,
            fallback,
            timeouts,
        }
    }

    /// Reads `layer` under `ctx`. Files are processed in lexicographic
    /// order; every failure downgrades that one file to fallback content.
    /// Stops early on cancellation, returning what was assembled.
    pub(crate) async fn load_layer(
        &self,
        snapshot: &IndexSnapshot,
        layer: &LayerId,
        ctx: &RequestContext,
    ) -> LayerContent {
        let files = snapshot.files(layer);
        let mut parts: Vec<String> = Vec::with_capacity(files.len());
        let mut statuses: Vec<FileStatus> = Vec::with_capacity(files.len());

        for file in &files {
            if ctx.is_cancelled() || ctx.deadline_elapsed() {
                break;
            }
            let Some((text, served, failure)) = self.load_file(file, ctx).await else {
                // Cancelled mid-read; the in-flight read future was dropped.
                break;
            };
            parts.push(text);
            statuses.push(FileStatus {
                path: file.relative_path.clone(),
                served,
                failure,
            });
        }

        let text = parts.join("\n\n");
        let token_estimate = estimate_tokens(text.len() as u64);
        LayerContent {
            layer: layer.clone(),
            text,
            token_estimate,
            files: statuses,
        }
    }

    /// `None` means the request was cancelled while this file was in flight.
    async fn load_file(
        &self,
        file: &FileRef,
        ctx: &RequestContext,
    ) -> Option<(String, ServedFrom, Option<FileFailure>)> {
        match self.cache.lookup(file, ctx) {
            CacheOutcome::Fresh(blob) => Some((blob.text(), ServedFrom::CacheFresh, None)),
            CacheOutcome::Stale(blob) => {
                // Serve immediately; refresh off the request path.
                self.cache.spawn_refresh(
                    file.clone(),
                    ctx.correlation().clone(),
                    self.timeouts.duration(TimeoutLevel::File),
                );
                Some((blob.text(), ServedFrom::CacheStale, None))
            }
            CacheOutcome::Miss => self.read_fresh(file, ctx).await,
        }
    }

    async fn read_fresh(
        &self,
        file: &FileRef,
        ctx: &RequestContext,
    ) -> Option<(String, ServedFrom, Option<FileFailure>)> {
        let deadline = self
            .timeouts
            .deadline(TimeoutLevel::File, None, ctx.deadline());
        let guarded = self.breaker.call(ctx.correlation(), || async {
            match self
                .timeouts
                .run(deadline, self.cache.read_through(file, ctx))
                .await
            {
                Ok(Ok(blob)) => Ok(blob),
                Ok(Err(error)) => Err(FileReadError::Read(error)),
                Err(_) => Err(FileReadError::Timeout),
            }
        });
        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return None,
            outcome = guarded => outcome,
        };

        match outcome {
            Ok(blob) => Some((blob.text(), ServedFrom::FreshRead, None)),
            Err(BreakerError::Open { .. }) => {
                let (text, tier) = self.fallback.file_fallback(file, ctx);
                Some((
                    text,
                    ServedFrom::from_tier(tier),
                    Some(FileFailure::CircuitOpen),
                ))
            }
            Err(BreakerError::Inner(error)) => {
                let failure = match &error {
                    FileReadError::Timeout => FileFailure::Timeout,
                    FileReadError::Read(read_error) => {
                        debug!(%read_error, path = %file.relative_path, "file read failed");
                        FileFailure::Io
                    }
                };
                let (text, tier) = self.fallback.file_fallback(file, ctx);
                Some((text, ServedFrom::from_tier(tier), Some(failure)))
            }
        }
    }
}
