//! Layered runtime configuration.
//!
//! Merge order, lowest precedence first: built-in defaults, the TOML config
//! file, `KB_*` environment variables, then per-call request overrides.
//! Unknown keys and out-of-range values produce [`ConfigWarning`]s and never
//! abort startup; the runtime continues on defaults.

use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::defaults;

/// Errors from reading or parsing the primary config file. These are the
/// only fatal configuration conditions; everything else is a warning.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Non-fatal configuration findings, surfaced at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    UnknownKey { key: String },
    Clamped { key: String, value: u64, clamped_to: u64 },
    InvalidEnv { var: String, value: String },
    InvalidTrigger { index: usize, reason: String },
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::UnknownKey { key } => write!(f, "unknown config key `{key}`"),
            ConfigWarning::Clamped {
                key,
                value,
                clamped_to,
            } => write!(f, "`{key}` = {value} out of range, clamped to {clamped_to}"),
            ConfigWarning::InvalidEnv { var, value } => {
                write!(f, "ignoring `{var}`: `{value}` is not valid")
            }
            ConfigWarning::InvalidTrigger { index, reason } => {
                write!(f, "ignoring loading.triggers[{index}]: {reason}")
            }
        }
    }
}

/// T1..T5 durations plus the hard ceiling applied to every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub cache_ms: u64,
    pub file_ms: u64,
    pub layer_ms: u64,
    pub full_ms: u64,
    pub complex_ms: u64,
    pub absolute_max_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            cache_ms: defaults::DEFAULT_TIMEOUT_CACHE_MS,
            file_ms: defaults::DEFAULT_TIMEOUT_FILE_MS,
            layer_ms: defaults::DEFAULT_TIMEOUT_LAYER_MS,
            full_ms: defaults::DEFAULT_TIMEOUT_FULL_MS,
            complex_ms: defaults::DEFAULT_TIMEOUT_COMPLEX_MS,
            absolute_max_ms: defaults::DEFAULT_TIMEOUT_ABSOLUTE_MAX_MS,
        }
    }
}

/// Hot-tier bounds and freshness horizons. `stale_ms` is measured from
/// insertion, like `ttl_ms`, and is always at least `ttl_ms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub max_bytes: usize,
    pub ttl_ms: u64,
    pub stale_ms: u64,
    /// Warm on-disk tier directory; `None` disables the tier.
    pub warm_dir: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: defaults::DEFAULT_CACHE_MAX_ENTRIES,
            max_bytes: defaults::DEFAULT_CACHE_MAX_BYTES,
            ttl_ms: defaults::DEFAULT_CACHE_TTL_MS,
            stale_ms: defaults::DEFAULT_CACHE_STALE_MS,
            warm_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::DEFAULT_BREAKER_FAILURE_THRESHOLD,
            reset_timeout_ms: defaults::DEFAULT_BREAKER_RESET_TIMEOUT_MS,
            half_open_requests: defaults::DEFAULT_BREAKER_HALF_OPEN_REQUESTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerPriority {
    High,
    Medium,
    Low,
}

impl TriggerPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerPriority::High => "high",
            TriggerPriority::Medium => "medium",
            TriggerPriority::Low => "low",
        }
    }
}

/// One selector rule: a pattern or keyword list mapping to target layers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TriggerRule {
    /// Regular expression matched case-insensitively against the task.
    pub pattern: Option<String>,
    /// Alternative to `pattern`: whole-word keywords, any of which matches.
    pub keywords: Vec<String>,
    pub layers: Vec<String>,
    pub priority: TriggerPriority,
}

impl Default for TriggerRule {
    fn default() -> Self {
        Self {
            pattern: None,
            keywords: Vec::new(),
            layers: Vec::new(),
            priority: TriggerPriority::Medium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingSettings {
    /// Layers admitted on every request, ahead of anything triggered.
    pub default_layers: Vec<String>,
    /// Per-request token ceiling when the request itself does not set one.
    pub max_tokens: Option<u64>,
    pub triggers: Vec<TriggerRule>,
}

impl Default for LoadingSettings {
    fn default() -> Self {
        Self {
            default_layers: defaults::DEFAULT_LAYERS.iter().map(|s| s.to_string()).collect(),
            max_tokens: None,
            triggers: Vec::new(),
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    pub content_root: PathBuf,
    pub timeouts: TimeoutSettings,
    pub cache: CacheSettings,
    pub breaker: BreakerSettings,
    pub loading: LoadingSettings,
    pub events_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            content_root: PathBuf::from(defaults::DEFAULT_CONTENT_ROOT),
            timeouts: TimeoutSettings::default(),
            cache: CacheSettings::default(),
            breaker: BreakerSettings::default(),
            loading: LoadingSettings::default(),
            events_enabled: true,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration: defaults, then `path` (skipped when `None` or
    /// missing), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<(Self, Vec<ConfigWarning>), ConfigError> {
        let mut warnings = Vec::new();
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let (config, mut file_warnings) =
                    Self::parse_toml(&raw).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                warnings.append(&mut file_warnings);
                config
            }
            _ => RuntimeConfig::default(),
        };
        config.apply_env(&mut warnings);
        config.validate(&mut warnings);
        Ok((config, warnings))
    }

    /// Parses a config document from a string. Used by `load` and by tests.
    pub fn from_toml_str(raw: &str) -> Result<(Self, Vec<ConfigWarning>), toml::de::Error> {
        let (mut config, mut warnings) = Self::parse_toml(raw)?;
        config.validate(&mut warnings);
        Ok((config, warnings))
    }

    fn parse_toml(raw: &str) -> Result<(Self, Vec<ConfigWarning>), toml::de::Error> {
        let value: toml::Value = raw.parse()?;
        let mut warnings = Vec::new();
        collect_unknown_keys(&value, &mut warnings);
        let file: FileConfig = FileConfig::deserialize(value)?;
        Ok((file.into_runtime(), warnings))
    }

    fn apply_env(&mut self, warnings: &mut Vec<ConfigWarning>) {
        if let Some(root) = env::var_os(defaults::CONTENT_ROOT_ENV) {
            self.content_root = PathBuf::from(root);
        }
        env_u64(defaults::TIMEOUT_CACHE_ENV, &mut self.timeouts.cache_ms, warnings);
        env_u64(defaults::TIMEOUT_FILE_ENV, &mut self.timeouts.file_ms, warnings);
        env_u64(defaults::TIMEOUT_LAYER_ENV, &mut self.timeouts.layer_ms, warnings);
        env_u64(defaults::TIMEOUT_FULL_ENV, &mut self.timeouts.full_ms, warnings);
        env_u64(defaults::TIMEOUT_COMPLEX_ENV, &mut self.timeouts.complex_ms, warnings);
        env_u64(
            defaults::TIMEOUT_ABSOLUTE_MAX_ENV,
            &mut self.timeouts.absolute_max_ms,
            warnings,
        );
        env_usize(defaults::CACHE_MAX_ENTRIES_ENV, &mut self.cache.max_entries, warnings);
        env_usize(defaults::CACHE_MAX_BYTES_ENV, &mut self.cache.max_bytes, warnings);
        env_u64(defaults::CACHE_TTL_ENV, &mut self.cache.ttl_ms, warnings);
        env_u64(defaults::CACHE_STALE_ENV, &mut self.cache.stale_ms, warnings);
        env_u32(
            defaults::BREAKER_FAILURE_THRESHOLD_ENV,
            &mut self.breaker.failure_threshold,
            warnings,
        );
        env_u64(
            defaults::BREAKER_RESET_TIMEOUT_ENV,
            &mut self.breaker.reset_timeout_ms,
            warnings,
        );
        env_u32(
            defaults::BREAKER_HALF_OPEN_REQUESTS_ENV,
            &mut self.breaker.half_open_requests,
            warnings,
        );
        if let Ok(raw) = env::var(defaults::LOADING_MAX_TOKENS_ENV) {
            match raw.parse::<u64>() {
                Ok(value) => self.loading.max_tokens = Some(value),
                Err(_) => warnings.push(ConfigWarning::InvalidEnv {
                    var: defaults::LOADING_MAX_TOKENS_ENV.to_string(),
                    value: raw,
                }),
            }
        }
        if let Ok(raw) = env::var(defaults::EVENTS_ENABLED_ENV) {
            match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.events_enabled = true,
                "0" | "false" | "no" => self.events_enabled = false,
                _ => warnings.push(ConfigWarning::InvalidEnv {
                    var: defaults::EVENTS_ENABLED_ENV.to_string(),
                    value: raw,
                }),
            }
        }
    }

    /// Enforces the duration invariants by clamping, and prunes malformed
    /// trigger rules. Every adjustment leaves a warning behind.
    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let max = self.timeouts.absolute_max_ms.max(1);
        self.timeouts.absolute_max_ms = max;

        let mut clamp = |key: &str, value: &mut u64| {
            let original = *value;
            let clamped = original.clamp(1, max);
            if clamped != original {
                warnings.push(ConfigWarning::Clamped {
                    key: key.to_string(),
                    value: original,
                    clamped_to: clamped,
                });
                *value = clamped;
            }
        };
        clamp("timeout.cache_ms", &mut self.timeouts.cache_ms);
        clamp("timeout.file_ms", &mut self.timeouts.file_ms);
        clamp("timeout.layer_ms", &mut self.timeouts.layer_ms);
        clamp("timeout.full_ms", &mut self.timeouts.full_ms);
        clamp("timeout.complex_ms", &mut self.timeouts.complex_ms);

        // T1 ≤ T2 ≤ T3 ≤ T4 ≤ T5: raise each level to at least its
        // predecessor.
        let ordered: [(&str, u64); 4] = [
            ("timeout.file_ms", self.timeouts.cache_ms),
            ("timeout.layer_ms", self.timeouts.file_ms.max(self.timeouts.cache_ms)),
            (
                "timeout.full_ms",
                self.timeouts
                    .layer_ms
                    .max(self.timeouts.file_ms)
                    .max(self.timeouts.cache_ms),
            ),
            (
                "timeout.complex_ms",
                self.timeouts
                    .full_ms
                    .max(self.timeouts.layer_ms)
                    .max(self.timeouts.file_ms)
                    .max(self.timeouts.cache_ms),
            ),
        ];
        let slots: [&mut u64; 4] = [
            &mut self.timeouts.file_ms,
            &mut self.timeouts.layer_ms,
            &mut self.timeouts.full_ms,
            &mut self.timeouts.complex_ms,
        ];
        for ((key, floor), slot) in ordered.into_iter().zip(slots) {
            if *slot < floor {
                warnings.push(ConfigWarning::Clamped {
                    key: key.to_string(),
                    value: *slot,
                    clamped_to: floor,
                });
                *slot = floor;
            }
        }

        if self.cache.stale_ms < self.cache.ttl_ms {
            warnings.push(ConfigWarning::Clamped {
                key: "cache.stale_ms".to_string(),
                value: self.cache.stale_ms,
                clamped_to: self.cache.ttl_ms,
            });
            self.cache.stale_ms = self.cache.ttl_ms;
        }
        if self.cache.max_entries == 0 {
            warnings.push(ConfigWarning::Clamped {
                key: "cache.max_entries".to_string(),
                value: 0,
                clamped_to: 1,
            });
            self.cache.max_entries = 1;
        }
        if self.breaker.failure_threshold == 0 {
            warnings.push(ConfigWarning::Clamped {
                key: "circuit_breaker.failure_threshold".to_string(),
                value: 0,
                clamped_to: 1,
            });
            self.breaker.failure_threshold = 1;
        }
        if self.breaker.half_open_requests == 0 {
            warnings.push(ConfigWarning::Clamped {
                key: "circuit_breaker.half_open_requests".to_string(),
                value: 0,
                clamped_to: 1,
            });
            self.breaker.half_open_requests = 1;
        }

        self.loading.triggers.retain({
            let mut index = 0usize;
            let warnings = &mut *warnings;
            move |rule| {
                let current = index;
                index += 1;
                if rule.layers.is_empty() {
                    warnings.push(ConfigWarning::InvalidTrigger {
                        index: current,
                        reason: "no target layers".to_string(),
                    });
                    return false;
                }
                if rule.pattern.is_none() && rule.keywords.is_empty() {
                    warnings.push(ConfigWarning::InvalidTrigger {
                        index: current,
                        reason: "neither pattern nor keywords".to_string(),
                    });
                    return false;
                }
                true
            }
        });
    }
}

fn env_u64(var: &str, target: &mut u64, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(var) {
        match raw.parse::<u64>() {
            Ok(value) => *target = value,
            Err(_) => warnings.push(ConfigWarning::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
        }
    }
}

fn env_u32(var: &str, target: &mut u32, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(var) {
        match raw.parse::<u32>() {
            Ok(value) => *target = value,
            Err(_) => warnings.push(ConfigWarning::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
        }
    }
}

fn env_usize(var: &str, target: &mut usize, warnings: &mut Vec<ConfigWarning>) {
    if let Ok(raw) = env::var(var) {
        match raw.parse::<usize>() {
            Ok(value) => *target = value,
            Err(_) => warnings.push(ConfigWarning::InvalidEnv {
                var: var.to_string(),
                value: raw,
            }),
        }
    }
}

// Serde shadow of the file format. Every field is optional so that missing
// keys fall back to defaults.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    content_root: Option<PathBuf>,
    timeout: FileTimeouts,
    cache: FileCache,
    circuit_breaker: FileBreaker,
    loading: FileLoading,
    events: FileEvents,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileTimeouts {
    cache_ms: Option<u64>,
    file_ms: Option<u64>,
    layer_ms: Option<u64>,
    full_ms: Option<u64>,
    complex_ms: Option<u64>,
    absolute_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileCache {
    max_entries: Option<usize>,
    max_bytes: Option<usize>,
    ttl_ms: Option<u64>,
    stale_ms: Option<u64>,
    warm_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileBreaker {
    failure_threshold: Option<u32>,
    reset_timeout_ms: Option<u64>,
    half_open_requests: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLoading {
    default_layers: Option<Vec<String>>,
    max_tokens: Option<u64>,
    triggers: Vec<TriggerRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileEvents {
    enabled: Option<bool>,
}

impl FileConfig {
    fn into_runtime(self) -> RuntimeConfig {
        let base = RuntimeConfig::default();
        RuntimeConfig {
            content_root: self.content_root.unwrap_or(base.content_root),
            timeouts: TimeoutSettings {
                cache_ms: self.timeout.cache_ms.unwrap_or(base.timeouts.cache_ms),
                file_ms: self.timeout.file_ms.unwrap_or(base.timeouts.file_ms),
                layer_ms: self.timeout.layer_ms.unwrap_or(base.timeouts.layer_ms),
                full_ms: self.timeout.full_ms.unwrap_or(base.timeouts.full_ms),
                complex_ms: self.timeout.complex_ms.unwrap_or(base.timeouts.complex_ms),
                absolute_max_ms: self
                    .timeout
                    .absolute_max_ms
                    .unwrap_or(base.timeouts.absolute_max_ms),
            },
            cache: CacheSettings {
                max_entries: self.cache.max_entries.unwrap_or(base.cache.max_entries),
                max_bytes: self.cache.max_bytes.unwrap_or(base.cache.max_bytes),
                ttl_ms: self.cache.ttl_ms.unwrap_or(base.cache.ttl_ms),
                stale_ms: self.cache.stale_ms.unwrap_or(base.cache.stale_ms),
                warm_dir: self.cache.warm_dir,
            },
            breaker: BreakerSettings {
                failure_threshold: self
                    .circuit_breaker
                    .failure_threshold
                    .unwrap_or(base.breaker.failure_threshold),
                reset_timeout_ms: self
                    .circuit_breaker
                    .reset_timeout_ms
                    .unwrap_or(base.breaker.reset_timeout_ms),
                half_open_requests: self
                    .circuit_breaker
                    .half_open_requests
                    .unwrap_or(base.breaker.half_open_requests),
            },
            loading: LoadingSettings {
                default_layers: self
                    .loading
                    .default_layers
                    .unwrap_or(base.loading.default_layers),
                max_tokens: self.loading.max_tokens.or(base.loading.max_tokens),
                triggers: self.loading.triggers,
            },
            events_enabled: self.events.enabled.unwrap_or(base.events_enabled),
        }
    }
}

/// Walks the parsed document against the known-key tree and records anything
/// unrecognized. Additive-only evolution: new keys never become errors here.
fn collect_unknown_keys(value: &toml::Value, warnings: &mut Vec<ConfigWarning>) {
    const TOP: &[&str] = &["content_root", "timeout", "cache", "circuit_breaker", "loading", "events"];
    const TIMEOUT: &[&str] = &[
        "cache_ms",
        "file_ms",
        "layer_ms",
        "full_ms",
        "complex_ms",
        "absolute_max_ms",
    ];
    const CACHE: &[&str] = &["max_entries", "max_bytes", "ttl_ms", "stale_ms", "warm_dir"];
    const BREAKER: &[&str] = &["failure_threshold", "reset_timeout_ms", "half_open_requests"];
    const LOADING: &[&str] = &["default_layers", "max_tokens", "triggers"];
    const TRIGGER: &[&str] = &["pattern", "keywords", "layers", "priority"];
    const EVENTS: &[&str] = &["enabled"];

    let Some(table) = value.as_table() else {
        return;
    };
    for (key, entry) in table {
        if !TOP.contains(&key.as_str()) {
            warnings.push(ConfigWarning::UnknownKey { key: key.clone() });
            continue;
        }
        let section: &[&str] = match key.as_str() {
            "timeout" => TIMEOUT,
            "cache" => CACHE,
            "circuit_breaker" => BREAKER,
            "loading" => LOADING,
            "events" => EVENTS,
            _ => continue,
        };
        let Some(nested) = entry.as_table() else {
            continue;
        };
        for (nested_key, nested_value) in nested {
            if !section.contains(&nested_key.as_str()) {
                warnings.push(ConfigWarning::UnknownKey {
                    key: format!("{key}.{nested_key}"),
                });
            } else if key == "loading" && nested_key == "triggers" {
                if let Some(rules) = nested_value.as_array() {
                    for (index, rule) in rules.iter().enumerate() {
                        let Some(rule) = rule.as_table() else {
                            continue;
                        };
                        for rule_key in rule.keys() {
                            if !TRIGGER.contains(&rule_key.as_str()) {
                                warnings.push(ConfigWarning::UnknownKey {
                                    key: format!("loading.triggers[{index}].{rule_key}"),
                                });
                            }
                        }
                    }
                }
            }
        }
    }
}
