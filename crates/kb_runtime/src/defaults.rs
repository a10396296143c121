//! Built-in defaults and the documented `KB_*` environment override set.

pub(crate) const DEFAULT_CONTENT_ROOT: &str = "knowledge";

pub(crate) const DEFAULT_TIMEOUT_CACHE_MS: u64 = 100;
pub(crate) const DEFAULT_TIMEOUT_FILE_MS: u64 = 500;
pub(crate) const DEFAULT_TIMEOUT_LAYER_MS: u64 = 2_000;
pub(crate) const DEFAULT_TIMEOUT_FULL_MS: u64 = 5_000;
pub(crate) const DEFAULT_TIMEOUT_COMPLEX_MS: u64 = 10_000;
pub(crate) const DEFAULT_TIMEOUT_ABSOLUTE_MAX_MS: u64 = 10_000;

pub(crate) const DEFAULT_CACHE_MAX_ENTRIES: usize = 256;
pub(crate) const DEFAULT_CACHE_MAX_BYTES: usize = 8 * 1024 * 1024;
pub(crate) const DEFAULT_CACHE_TTL_MS: u64 = 60_000;
pub(crate) const DEFAULT_CACHE_STALE_MS: u64 = 300_000;

pub(crate) const DEFAULT_BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub(crate) const DEFAULT_BREAKER_RESET_TIMEOUT_MS: u64 = 30_000;
pub(crate) const DEFAULT_BREAKER_HALF_OPEN_REQUESTS: u32 = 2;

pub(crate) const DEFAULT_LAYERS: &[&str] = &["core"];

/// Breaker scope guarding content-tree reads.
pub(crate) const CONTENT_BREAKER_SCOPE: &str = "io.content";

pub(crate) const CONTENT_ROOT_ENV: &str = "KB_CONTENT_ROOT";
pub(crate) const TIMEOUT_CACHE_ENV: &str = "KB_TIMEOUT_CACHE_MS";
pub(crate) const TIMEOUT_FILE_ENV: &str = "KB_TIMEOUT_FILE_MS";
pub(crate) const TIMEOUT_LAYER_ENV: &str = "KB_TIMEOUT_LAYER_MS";
pub(crate) const TIMEOUT_FULL_ENV: &str = "KB_TIMEOUT_FULL_MS";
pub(crate) const TIMEOUT_COMPLEX_ENV: &str = "KB_TIMEOUT_COMPLEX_MS";
pub(crate) const TIMEOUT_ABSOLUTE_MAX_ENV: &str = "KB_TIMEOUT_ABSOLUTE_MAX_MS";
pub(crate) const CACHE_MAX_ENTRIES_ENV: &str = "KB_CACHE_MAX_ENTRIES";
pub(crate) const CACHE_MAX_BYTES_ENV: &str = "KB_CACHE_MAX_BYTES";
pub(crate) const CACHE_TTL_ENV: &str = "KB_CACHE_TTL_MS";
pub(crate) const CACHE_STALE_ENV: &str = "KB_CACHE_STALE_MS";
pub(crate) const BREAKER_FAILURE_THRESHOLD_ENV: &str = "KB_BREAKER_FAILURE_THRESHOLD";
pub(crate) const BREAKER_RESET_TIMEOUT_ENV: &str = "KB_BREAKER_RESET_TIMEOUT_MS";
pub(crate) const BREAKER_HALF_OPEN_REQUESTS_ENV: &str = "KB_BREAKER_HALF_OPEN_REQUESTS";
pub(crate) const LOADING_MAX_TOKENS_ENV: &str = "KB_LOADING_MAX_TOKENS";
pub(crate) const EVENTS_ENABLED_ENV: &str = "KB_EVENTS_ENABLED";
