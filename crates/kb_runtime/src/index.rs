//! The knowledge index: an immutable, atomically replaceable snapshot of the
//! content tree.
//!
//! A scan walks `content_root`, admits `.md` files, fingerprints their bytes,
//! and groups them by layer (the directory path relative to the root, with
//! forward slashes). Readers pin one [`IndexSnapshot`] for the duration of a
//! request; rescans build a fresh snapshot and swap it in atomically.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use tracing::{debug, warn};

use crate::fingerprint::{estimate_tokens, Fingerprint};

/// Validated layer identifier: one or more `/`-separated path segments of
/// ASCII alphanumerics plus `.`, `_`, `-`, each starting alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(String);

impl LayerId {
    pub const MAX_BYTES: usize = 128;

    pub fn new(raw: &str) -> Option<Self> {
        if raw.is_empty() || raw.len() > Self::MAX_BYTES || !raw.is_ascii() {
            return None;
        }
        for segment in raw.split('/') {
            let mut chars = segment.chars();
            let Some(first) = chars.next() else {
                return None;
            };
            if !first.is_ascii_alphanumeric() {
                return None;
            }
            if !chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
                return None;
            }
        }
        Some(LayerId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First path segment; the top-level layer this id belongs to.
    pub fn root(&self) -> &str {
        self.0.split('/').next().unwrap_or(&self.0)
    }

    /// True when `self` is `prefix` itself or nested below it.
    pub(crate) fn is_under(&self, prefix: &LayerId) -> bool {
        self.0 == prefix.0
            || (self.0.len() > prefix.0.len()
                && self.0.starts_with(&prefix.0)
                && self.0.as_bytes()[prefix.0.len()] == b'/')
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One indexed content file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// Innermost layer (directory) containing the file.
    pub layer: LayerId,
    /// Forward-slash path relative to the content root; the cache key path.
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub fingerprint: Fingerprint,
}

impl FileRef {
    pub fn token_estimate(&self) -> u64 {
        estimate_tokens(self.size)
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_path)
    }
}

/// Immutable view of the content tree produced by one scan.
#[derive(Debug)]
pub struct IndexSnapshot {
    content_root: PathBuf,
    layers: BTreeMap<LayerId, Vec<FileRef>>,
    scanned_at: SystemTime,
}

impl IndexSnapshot {
    pub fn empty(content_root: PathBuf) -> Self {
        Self {
            content_root,
            layers: BTreeMap::new(),
            scanned_at: SystemTime::now(),
        }
    }

    pub fn content_root(&self) -> &Path {
        &self.content_root
    }

    pub fn scanned_at(&self) -> SystemTime {
        self.scanned_at
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// All directory layers, lexicographic.
    pub fn layer_ids(&self) -> Vec<LayerId> {
        self.layers.keys().cloned().collect()
    }

    pub fn contains_layer(&self, layer: &LayerId) -> bool {
        self.layers
            .keys()
            .any(|candidate| candidate.is_under(layer))
    }

    /// Every file admitted by `layer`, including nested sublayers, sorted
    /// lexicographically by relative path.
    pub fn files(&self, layer: &LayerId) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self
            .layers
            .iter()
            .filter(|(candidate, _)| candidate.is_under(layer))
            .flat_map(|(_, files)| files.iter().cloned())
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files
    }

    pub fn all_files(&self) -> Vec<FileRef> {
        let mut files: Vec<FileRef> = self
            .layers
            .values()
            .flat_map(|files| files.iter().cloned())
            .collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        files
    }

    /// Sum of the layer's files' token estimates; the selector's layer cost.
    pub fn layer_token_estimate(&self, layer: &LayerId) -> u64 {
        self.files(layer).iter().map(FileRef::token_estimate).sum()
    }

    pub fn layer_byte_size(&self, layer: &LayerId) -> u64 {
        self.files(layer).iter().map(|file| file.size).sum()
    }
}

/// Owner of the current snapshot. Rescans are single-flight: concurrent
/// callers wait for the in-progress scan and share its snapshot.
pub struct KnowledgeIndex {
    root: PathBuf,
    current: ArcSwap<IndexSnapshot>,
    rescan_gate: tokio::sync::Mutex<()>,
}

impl KnowledgeIndex {
    /// Scans `root` and installs the initial snapshot. A missing or unreadable
    /// root yields an empty index rather than an error; the loader then serves
    /// packaged fallbacks.
    pub async fn bootstrap(root: PathBuf) -> Self {
        let snapshot = match scan_tree(&root).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(?error, root = %root.display(), "content scan failed; starting empty");
                IndexSnapshot::empty(root.clone())
            }
        };
        Self {
            root,
            current: ArcSwap::from_pointee(snapshot),
            rescan_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.current.load_full()
    }

    /// Rebuilds the snapshot. If a rescan is already running, waits for it
    /// and returns its result instead of scanning again.
    pub async fn rescan(&self) -> Arc<IndexSnapshot> {
        let Ok(_guard) = self.rescan_gate.try_lock() else {
            let _wait = self.rescan_gate.lock().await;
            return self.snapshot();
        };
        match scan_tree(&self.root).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.current.store(Arc::clone(&snapshot));
                snapshot
            }
            Err(error) => {
                warn!(?error, root = %self.root.display(), "rescan failed; keeping snapshot");
                self.snapshot()
            }
        }
    }
}

impl fmt::Debug for KnowledgeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnowledgeIndex")
            .field("root", &self.root)
            .field("layers", &self.snapshot().layer_ids().len())
            .finish()
    }
}

/// Walks the content tree. Hidden directories are skipped; only `.md` files
/// are admitted; files directly under the root belong to no layer and are
/// ignored.
async fn scan_tree(root: &Path) -> io::Result<IndexSnapshot> {
    let mut layers: BTreeMap<LayerId, Vec<FileRef>> = BTreeMap::new();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(path = %path.display(), "skipping non-utf8 name");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !name.ends_with(".md") {
                continue;
            }
            let Some(relative) = relative_slash_path(root, &path) else {
                continue;
            };
            let Some(layer) = layer_of(&relative) else {
                // Root-level file; layers are directories.
                continue;
            };
            match index_file(layer, relative, path).await {
                Ok(file) => layers.entry(file.layer.clone()).or_default().push(file),
                Err(error) => {
                    debug!(?error, "skipping unreadable file during scan");
                }
            }
        }
    }

    for files in layers.values_mut() {
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    }
    Ok(IndexSnapshot {
        content_root: root.to_path_buf(),
        layers,
        scanned_at: SystemTime::now(),
    })
}

async fn index_file(layer: LayerId, relative: String, path: PathBuf) -> io::Result<FileRef> {
    let metadata = tokio::fs::metadata(&path).await?;
    let bytes = tokio::fs::read(&path).await?;
    Ok(FileRef {
        layer,
        relative_path: relative,
        absolute_path: path,
        size: metadata.len(),
        modified: metadata.modified().ok(),
        fingerprint: Fingerprint::of(&bytes),
    })
}

fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        let segment = component.as_os_str().to_str()?;
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(segment);
    }
    Some(out)
}

fn layer_of(relative: &str) -> Option<LayerId> {
    let (dir, _file) = relative.rsplit_once('/')?;
    LayerId::new(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("mkdir");
        }
        tokio::fs::write(&path, contents).await.expect("write");
    }

    #[test]
    fn layer_id_validation() {
        assert!(LayerId::new("core").is_some());
        assert!(LayerId::new("frameworks/react").is_some());
        assert!(LayerId::new("a.b_c-d").is_some());
        assert!(LayerId::new("").is_none());
        assert!(LayerId::new("/core").is_none());
        assert!(LayerId::new("core/").is_none());
        assert!(LayerId::new("core//deep").is_none());
        assert!(LayerId::new("..").is_none());
        assert!(LayerId::new("côre").is_none());
    }

    #[tokio::test]
    async fn scan_groups_files_by_layer_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "core/b.md", "bb").await;
        write(dir.path(), "core/a.md", "aaa").await;
        write(dir.path(), "guidelines/style.md", "s").await;
        write(dir.path(), "frameworks/react/hooks.md", "h").await;
        write(dir.path(), "core/notes.txt", "ignored").await;
        write(dir.path(), "TOP.md", "ignored").await;
        write(dir.path(), ".hidden/x.md", "ignored").await;

        let index = KnowledgeIndex::bootstrap(dir.path().to_path_buf()).await;
        let snapshot = index.snapshot();

        let core = LayerId::new("core").unwrap();
        let files = snapshot.files(&core);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].relative_path, "core/a.md");
        assert_eq!(files[1].relative_path, "core/b.md");
        assert_eq!(files[0].size, 3);
        assert_eq!(snapshot.layer_token_estimate(&core), 2);

        // "frameworks" admits the nested "frameworks/react" files.
        let frameworks = LayerId::new("frameworks").unwrap();
        assert!(snapshot.contains_layer(&frameworks));
        assert_eq!(snapshot.files(&frameworks).len(), 1);

        let ids = snapshot.layer_ids();
        assert!(ids.contains(&LayerId::new("frameworks/react").unwrap()));
        assert!(!ids.iter().any(|id| id.as_str().starts_with('.')));
    }

    #[tokio::test]
    async fn missing_root_bootstraps_empty() {
        let index =
            KnowledgeIndex::bootstrap(PathBuf::from("/nonexistent/kb-content-root")).await;
        assert!(index.snapshot().is_empty());
    }

    #[tokio::test]
    async fn rescan_picks_up_new_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "core/a.md", "aaa").await;
        let index = KnowledgeIndex::bootstrap(dir.path().to_path_buf()).await;
        assert_eq!(index.snapshot().all_files().len(), 1);

        write(dir.path(), "core/b.md", "bb").await;
        let before = index.snapshot();
        let after = index.rescan().await;
        assert_eq!(after.all_files().len(), 2);
        // The old snapshot is untouched; readers holding it are unaffected.
        assert_eq!(before.all_files().len(), 1);
    }
}
