use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

/// Closed set of lifecycle events emitted by the runtime.
///
/// The wire name (`as_str`) is stable and dotted; consumers should match on
/// the enum, not the string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LoadStart,
    LoadLayerStart,
    LoadLayerComplete,
    LoadLayerTimeout,
    LoadLayerFallback,
    LoadComplete,
    CacheHit,
    CacheMiss,
    CacheStaleHit,
    CacheEvict,
    BreakerOpen,
    BreakerHalfOpen,
    BreakerClose,
    CapabilityStart,
    CapabilityComplete,
    CapabilityTimeout,
    BusDrop,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::LoadStart,
        EventKind::LoadLayerStart,
        EventKind::LoadLayerComplete,
        EventKind::LoadLayerTimeout,
        EventKind::LoadLayerFallback,
        EventKind::LoadComplete,
        EventKind::CacheHit,
        EventKind::CacheMiss,
        EventKind::CacheStaleHit,
        EventKind::CacheEvict,
        EventKind::BreakerOpen,
        EventKind::BreakerHalfOpen,
        EventKind::BreakerClose,
        EventKind::CapabilityStart,
        EventKind::CapabilityComplete,
        EventKind::CapabilityTimeout,
        EventKind::BusDrop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::LoadStart => "load.start",
            EventKind::LoadLayerStart => "load.layer.start",
            EventKind::LoadLayerComplete => "load.layer.complete",
            EventKind::LoadLayerTimeout => "load.layer.timeout",
            EventKind::LoadLayerFallback => "load.layer.fallback",
            EventKind::LoadComplete => "load.complete",
            EventKind::CacheHit => "cache.hit",
            EventKind::CacheMiss => "cache.miss",
            EventKind::CacheStaleHit => "cache.stale_hit",
            EventKind::CacheEvict => "cache.evict",
            EventKind::BreakerOpen => "breaker.open",
            EventKind::BreakerHalfOpen => "breaker.halfopen",
            EventKind::BreakerClose => "breaker.close",
            EventKind::CapabilityStart => "capability.start",
            EventKind::CapabilityComplete => "capability.complete",
            EventKind::CapabilityTimeout => "capability.timeout",
            EventKind::BusDrop => "bus.drop",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event. Field payloads are free-form JSON so new diagnostics
/// can be added without breaking subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub correlation_id: String,
    /// Nanoseconds since the Unix epoch at emission time.
    pub timestamp_ns: u64,
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, correlation_id: impl Into<String>) -> Self {
        Self {
            kind,
            correlation_id: correlation_id.into(),
            timestamp_ns: now_ns(),
            fields: Map::new(),
        }
    }

    /// Attaches a field, builder style.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
