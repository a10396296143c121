use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use kb_events::{EventBus, EventKind, Subscription};

use crate::config::RuntimeConfig;
use crate::loader::KnowledgeLoader;
use crate::source::{ContentSource, SourceFuture};

/// Temporary content tree for end-to-end scenarios.
pub(super) struct TestTree {
    dir: TempDir,
}

impl TestTree {
    pub(super) fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub(super) fn root(&self) -> &Path {
        self.dir.path()
    }

    pub(super) fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub(super) async fn write(&self, relative: &str, contents: &str) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("mkdir");
        }
        tokio::fs::write(&path, contents).await.expect("write");
    }

    pub(super) async fn write_bytes(&self, relative: &str, contents: &[u8]) {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.expect("mkdir");
        }
        tokio::fs::write(&path, contents).await.expect("write");
    }

    pub(super) async fn remove(&self, relative: &str) {
        tokio::fs::remove_file(self.path(relative))
            .await
            .expect("remove");
    }
}

/// Content source whose per-path behavior is scripted by the test: reads can
/// fail, sleep, or pass through to the filesystem, and every source hit is
/// counted.
pub(super) struct ScriptedSource {
    reads: AtomicUsize,
    failing: Mutex<HashSet<PathBuf>>,
    delays: Mutex<HashMap<PathBuf, Duration>>,
}

impl ScriptedSource {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self {
            reads: AtomicUsize::new(0),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
        })
    }

    pub(super) fn fail(&self, path: PathBuf) {
        self.failing.lock().expect("failing set").insert(path);
    }

    pub(super) fn heal(&self, path: &Path) {
        self.failing.lock().expect("failing set").remove(path);
    }

    pub(super) fn delay(&self, path: PathBuf, delay: Duration) {
        self.delays.lock().expect("delay map").insert(path, delay);
    }

    pub(super) fn source_reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl ContentSource for ScriptedSource {
    fn read(&self, path: &Path) -> SourceFuture<io::Result<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let fail = self.failing.lock().expect("failing set").contains(path);
        let delay = self
            .delays
            .lock()
            .expect("delay map")
            .get(path)
            .copied()
            .unwrap_or(Duration::ZERO);
        let path = path.to_path_buf();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "scripted read failure",
                ));
            }
            // Synchronous read on purpose: paused-clock tests must not
            // yield mid-read, or auto-advance would fire deadline timers
            // before the bytes arrive.
            std::fs::read(&path)
        })
    }
}

/// Builds a loader over `tree` with `tweak` applied to the default config.
pub(super) async fn build_loader(
    tree: &TestTree,
    bus: EventBus,
    source: Option<Arc<dyn ContentSource>>,
    tweak: impl FnOnce(&mut RuntimeConfig),
) -> KnowledgeLoader {
    let mut config = RuntimeConfig::default();
    config.content_root = tree.root().to_path_buf();
    tweak(&mut config);
    let mut builder = KnowledgeLoader::builder().config(config).event_bus(bus);
    if let Some(source) = source {
        builder = builder.content_source(source);
    }
    builder.build().await
}

pub(super) fn drain_kinds(subscription: &mut Subscription) -> Vec<EventKind> {
    subscription
        .drain()
        .into_iter()
        .map(|event| event.kind)
        .collect()
}

pub(super) fn count_kind(kinds: &[EventKind], kind: EventKind) -> usize {
    kinds.iter().filter(|candidate| **candidate == kind).count()
}
