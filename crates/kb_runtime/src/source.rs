//! The seam between the cache and the filesystem.
//!
//! Production code always reads through [`FsSource`]; tests substitute slow
//! or failing sources to exercise timeout and breaker behavior without
//! touching real I/O latency.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;

pub type SourceFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Read-only byte source for content files.
pub trait ContentSource: Send + Sync + 'static {
    fn read(&self, path: &Path) -> SourceFuture<io::Result<Vec<u8>>>;
}

/// Reads straight from the filesystem via `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSource;

impl ContentSource for FsSource {
    fn read(&self, path: &Path) -> SourceFuture<io::Result<Vec<u8>>> {
        let path = path.to_path_buf();
        Box::pin(async move { tokio::fs::read(&path).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_source_reads_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.md");
        tokio::fs::write(&path, b"hello").await.expect("write");
        let bytes = FsSource.read(&path).await.expect("read");
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn fs_source_surfaces_missing_files() {
        let err = FsSource
            .read(Path::new("/definitely/not/here.md"))
            .await
            .expect_err("missing file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
