//! Case-insensitive search over the indexed content tree.

use serde::Serialize;

use crate::context::RequestContext;
use crate::loader::KnowledgeLoader;
use crate::timeout::TimeoutLevel;

/// One matching line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchMatch {
    pub layer: String,
    pub file: String,
    /// 1-based line number.
    pub line: u64,
    pub text: String,
}

impl KnowledgeLoader {
    /// Scans every indexed file for `query` (case-insensitive substring),
    /// returning up to `limit` matches in file order. The whole scan is
    /// bounded by the complex-analysis deadline and each read by the
    /// file-level one; slow or unreadable files are skipped silently —
    /// search is a convenience view, not the read path.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchMatch> {
        let query = query.trim().to_lowercase();
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }
        let ctx = RequestContext::new();
        let deadline = self
            .timeouts()
            .deadline(TimeoutLevel::Complex, None, None);
        let ctx = ctx.child(deadline);

        let snapshot = self.index().snapshot();
        let mut matches = Vec::new();
        'files: for file in snapshot.all_files() {
            if ctx.deadline_elapsed() {
                break;
            }
            let blob = match self.cache().lookup(&file, &ctx) {
                crate::cache::CacheOutcome::Fresh(blob)
                | crate::cache::CacheOutcome::Stale(blob) => blob,
                crate::cache::CacheOutcome::Miss => {
                    let read_deadline =
                        self.timeouts()
                            .deadline(TimeoutLevel::File, None, ctx.deadline());
                    match self
                        .timeouts()
                        .run(read_deadline, self.cache().read_through(&file, &ctx))
                        .await
                    {
                        Ok(Ok(blob)) => blob,
                        Ok(Err(_)) | Err(_) => continue,
                    }
                }
            };
            let text = blob.text();
            for (index, line) in text.lines().enumerate() {
                if line.to_lowercase().contains(&query) {
                    matches.push(SearchMatch {
                        layer: file.layer.as_str().to_string(),
                        file: file.relative_path.clone(),
                        line: index as u64 + 1,
                        text: line.trim_end().to_string(),
                    });
                    if matches.len() >= limit {
                        break 'files;
                    }
                }
            }
        }
        matches
    }
}
