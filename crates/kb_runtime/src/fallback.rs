//! Hierarchical fallback content.
//!
//! When a fresh read is unavailable, content is sourced in fixed priority
//! order: stale cache entry → packaged default (embedded with the binary,
//! keyed by layer) → emergency string. The provider reports which tier
//! served so the loader can surface it in status and warnings; the loader is
//! therefore guaranteed to always return *something*.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::cache::ContentCache;
use crate::context::RequestContext;
use crate::index::{FileRef, LayerId};

const PACKAGED_DEFAULTS: &str = include_str!("../assets/packaged_defaults.toml");

/// Last-resort content when even the packaged defaults have no entry.
pub(crate) const EMERGENCY_CONTENT: &str = "# Core principles\n\
- Prefer the smallest change that solves the problem.\n\
- Make behavior observable before making it fast.\n";

/// Which rung of the fallback ladder actually served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    StaleCache,
    Packaged,
    Emergency,
}

impl FallbackTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackTier::StaleCache => "stale_cache",
            FallbackTier::Packaged => "packaged_default",
            FallbackTier::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Deserialize)]
struct PackagedFile {
    #[serde(default)]
    layers: HashMap<String, String>,
}

pub struct FallbackProvider {
    cache: Arc<ContentCache>,
    packaged: HashMap<String, String>,
}

impl FallbackProvider {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        let packaged = match toml::from_str::<PackagedFile>(PACKAGED_DEFAULTS) {
            Ok(parsed) => parsed.layers,
            Err(error) => {
                // The resource ships with the binary; failing to parse it is
                // a build defect, but the emergency tier still holds the
                // always-returns contract.
                warn!(?error, "packaged fallback resource failed to parse");
                HashMap::new()
            }
        };
        Self { cache, packaged }
    }

    /// Substitute content for a single file that could not be read fresh.
    pub fn file_fallback(&self, file: &FileRef, ctx: &RequestContext) -> (String, FallbackTier) {
        if let Some(blob) = self.cache.stale_blob(file, ctx) {
            return (blob.text(), FallbackTier::StaleCache);
        }
        self.packaged_or_emergency(&file.layer)
    }

    /// Substitute content for a whole layer, used when the layer was never
    /// read (breaker open) or timed out before producing anything. Stale
    /// entries for any of the layer's files are preferred, concatenated in
    /// file order.
    pub fn layer_fallback(
        &self,
        layer: &LayerId,
        files: &[FileRef],
        ctx: &RequestContext,
    ) -> (String, FallbackTier) {
        let stale: Vec<String> = files
            .iter()
            .filter_map(|file| self.cache.stale_blob(file, ctx).map(|blob| blob.text()))
            .collect();
        if !stale.is_empty() {
            return (stale.join("\n\n"), FallbackTier::StaleCache);
        }
        self.packaged_or_emergency(layer)
    }

    fn packaged_or_emergency(&self, layer: &LayerId) -> (String, FallbackTier) {
        // Exact layer id first, then its top-level layer.
        if let Some(content) = self
            .packaged
            .get(layer.as_str())
            .or_else(|| self.packaged.get(layer.root()))
        {
            return (content.clone(), FallbackTier::Packaged);
        }
        (EMERGENCY_CONTENT.to_string(), FallbackTier::Emergency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOutcome;
    use crate::config::CacheSettings;
    use crate::fingerprint::Fingerprint;
    use crate::source::FsSource;
    use kb_events::EventBus;
    use std::path::Path;

    fn provider_with_cache() -> (FallbackProvider, Arc<ContentCache>) {
        let cache = Arc::new(ContentCache::new(
            &CacheSettings::default(),
            Arc::new(FsSource),
            EventBus::disabled(),
        ));
        (FallbackProvider::new(Arc::clone(&cache)), cache)
    }

    fn file_ref(dir: &Path, relative: &str, contents: &[u8]) -> FileRef {
        let absolute = dir.join(relative);
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&absolute, contents).expect("write");
        FileRef {
            layer: LayerId::new(relative.rsplit_once('/').unwrap().0).unwrap(),
            relative_path: relative.to_string(),
            absolute_path: absolute,
            size: contents.len() as u64,
            modified: None,
            fingerprint: Fingerprint::of(contents),
        }
    }

    #[test]
    fn packaged_defaults_parse_and_cover_known_layers() {
        let (provider, _cache) = provider_with_cache();
        for layer in ["core", "guidelines", "frameworks", "practices", "scenarios", "templates"] {
            assert!(
                provider.packaged.contains_key(layer),
                "missing packaged default for {layer}"
            );
        }
    }

    #[tokio::test]
    async fn file_fallback_prefers_stale_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = file_ref(dir.path(), "core/a.md", b"cached body");
        let (provider, cache) = provider_with_cache();
        let ctx = RequestContext::new();

        // Nothing cached yet: packaged default for `core`.
        let (content, tier) = provider.file_fallback(&file, &ctx);
        assert_eq!(tier, FallbackTier::Packaged);
        assert!(content.contains("Core principles"));

        cache.read_through(&file, &ctx).await.expect("prime cache");
        assert!(matches!(cache.lookup(&file, &ctx), CacheOutcome::Fresh(_)));
        let (content, tier) = provider.file_fallback(&file, &ctx);
        assert_eq!(tier, FallbackTier::StaleCache);
        assert_eq!(content, "cached body");
    }

    #[tokio::test]
    async fn layer_fallback_concatenates_stale_files_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = file_ref(dir.path(), "core/a.md", b"aaa");
        let b = file_ref(dir.path(), "core/b.md", b"bb");
        let (provider, cache) = provider_with_cache();
        let ctx = RequestContext::new();
        cache.read_through(&a, &ctx).await.expect("a");
        cache.read_through(&b, &ctx).await.expect("b");

        let layer = LayerId::new("core").unwrap();
        let (content, tier) =
            provider.layer_fallback(&layer, &[a.clone(), b.clone()], &ctx);
        assert_eq!(tier, FallbackTier::StaleCache);
        assert_eq!(content, "aaa\n\nbb");
    }

    #[test]
    fn unknown_layer_falls_to_emergency() {
        let (provider, _cache) = provider_with_cache();
        let layer = LayerId::new("made-up").unwrap();
        let (content, tier) = provider.layer_fallback(&layer, &[], &RequestContext::new());
        assert_eq!(tier, FallbackTier::Emergency);
        assert_eq!(content, EMERGENCY_CONTENT);
    }

    #[test]
    fn nested_layer_uses_top_level_packaged_default() {
        let (provider, _cache) = provider_with_cache();
        let layer = LayerId::new("frameworks/react").unwrap();
        let (content, tier) = provider.layer_fallback(&layer, &[], &RequestContext::new());
        assert_eq!(tier, FallbackTier::Packaged);
        assert!(content.contains("Framework notes"));
    }
}
