//! Capability registry and dispatcher.
//!
//! Capabilities are small typed operations (analyzers, checkers, monitors,
//! converters, generators) registered at startup and invoked under the same
//! deadline and circuit-breaker discipline as content reads. The contract
//! here is deliberately thin: JSON in, JSON out, a descriptor declaring the
//! input/output kinds and the timeout level. Concrete implementations live
//! with their owners, not in this crate.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use kb_events::{Event, EventBus, EventKind};

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::BreakerSettings;
use crate::context::RequestContext;
use crate::error::LoadError;
use crate::timeout::{TimeoutLevel, Timeouts};

pub type CapabilityFuture =
    Pin<Box<dyn Future<Output = Result<Value, CapabilityError>> + Send + 'static>>;

/// The five capability families. Each family gets its own breaker scope so
/// a misbehaving checker cannot trip analyzers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityFamily {
    Analyzer,
    Checker,
    Monitor,
    Converter,
    Generator,
}

impl CapabilityFamily {
    pub const ALL: [CapabilityFamily; 5] = [
        CapabilityFamily::Analyzer,
        CapabilityFamily::Checker,
        CapabilityFamily::Monitor,
        CapabilityFamily::Converter,
        CapabilityFamily::Generator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityFamily::Analyzer => "analyzer",
            CapabilityFamily::Checker => "checker",
            CapabilityFamily::Monitor => "monitor",
            CapabilityFamily::Converter => "converter",
            CapabilityFamily::Generator => "generator",
        }
    }

    pub fn breaker_scope(&self) -> String {
        format!("capability.{}", self.as_str())
    }
}

/// Registration-time metadata for one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub family: CapabilityFamily,
    pub version: String,
    /// Free-form kind tags, e.g. `"markdown"` → `"report"`. The dispatcher
    /// passes them through for callers to negotiate on.
    pub input_kind: String,
    pub output_kind: String,
    pub default_timeout_level: TimeoutLevel,
}

/// Error returned by a capability implementation itself.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A runnable capability. Implementations must respect the context deadline
/// and cancellation; the dispatcher enforces both regardless.
pub trait Capability: Send + Sync + 'static {
    fn run(&self, input: Value, ctx: &RequestContext) -> CapabilityFuture;
}

/// Typed outcome of a dispatch. Timeouts and open circuits are results, not
/// errors; only an unknown `(family, name)` is rejected outright.
#[derive(Debug)]
pub enum CapabilityOutcome {
    Ok(Value),
    Timeout { elapsed_ms: u64 },
    CircuitOpen,
    Failed { message: String },
}

impl CapabilityOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CapabilityOutcome::Ok(_))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("capability {family:?}/{name} is already registered")]
    Duplicate {
        family: CapabilityFamily,
        name: String,
    },
}

struct Registered {
    descriptor: CapabilityDescriptor,
    handler: Arc<dyn Capability>,
}

/// `(family, name)`-keyed capability store, populated at startup.
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: HashMap<(CapabilityFamily, String), Registered>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        descriptor: CapabilityDescriptor,
        handler: Arc<dyn Capability>,
    ) -> Result<(), RegistryError> {
        let key = (descriptor.family, descriptor.name.clone());
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate {
                family: descriptor.family,
                name: descriptor.name,
            });
        }
        self.entries.insert(key, Registered { descriptor, handler });
        Ok(())
    }

    pub fn descriptor(&self, family: CapabilityFamily, name: &str) -> Option<&CapabilityDescriptor> {
        self.entries
            .get(&(family, name.to_string()))
            .map(|entry| &entry.descriptor)
    }

    /// All descriptors, sorted by family then name for stable listings.
    pub fn descriptors(&self) -> Vec<&CapabilityDescriptor> {
        let mut all: Vec<&CapabilityDescriptor> =
            self.entries.values().map(|entry| &entry.descriptor).collect();
        all.sort_by(|a, b| {
            (a.family.as_str(), a.name.as_str()).cmp(&(b.family.as_str(), b.name.as_str()))
        });
        all
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runs registered capabilities under deadlines and per-family breakers.
pub struct CapabilityDispatcher {
    registry: CapabilityRegistry,
    breakers: HashMap<CapabilityFamily, CircuitBreaker>,
    timeouts: Timeouts,
    bus: EventBus,
}

impl CapabilityDispatcher {
    pub fn new(
        registry: CapabilityRegistry,
        settings: BreakerSettings,
        timeouts: Timeouts,
        bus: EventBus,
    ) -> Self {
        let breakers = CapabilityFamily::ALL
            .into_iter()
            .map(|family| {
                (
                    family,
                    CircuitBreaker::new(family.breaker_scope(), settings, bus.clone()),
                )
            })
            .collect();
        Self {
            registry,
            breakers,
            timeouts,
            bus,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Dispatches one invocation. An unknown capability is a `BadRequest`;
    /// everything else folds into [`CapabilityOutcome`].
    pub async fn run(
        &self,
        family: CapabilityFamily,
        name: &str,
        input: Value,
        ctx: &RequestContext,
        override_timeout_ms: Option<u64>,
    ) -> Result<CapabilityOutcome, LoadError> {
        let Some(entry) = self.registry.entries.get(&(family, name.to_string())) else {
            return Err(LoadError::bad_request(format!(
                "unknown capability {}/{name}",
                family.as_str()
            )));
        };
        let deadline = self.timeouts.deadline(
            entry.descriptor.default_timeout_level,
            override_timeout_ms,
            ctx.deadline(),
        );
        let started = tokio::time::Instant::now();
        self.bus.publish(
            Event::new(EventKind::CapabilityStart, ctx.correlation().as_str())
                .with_field("family", family.as_str())
                .with_field("name", name),
        );

        let breaker = self
            .breakers
            .get(&family)
            .expect("every family has a breaker");
        let guarded = breaker
            .call(ctx.correlation(), || async {
                match self.timeouts.run(deadline, entry.handler.run(input, ctx)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(RunFailure::Invocation(error)),
                    Err(_) => Err(RunFailure::Timeout),
                }
            })
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = match guarded {
            Ok(value) => CapabilityOutcome::Ok(value),
            Err(BreakerError::Open { .. }) => CapabilityOutcome::CircuitOpen,
            Err(BreakerError::Inner(RunFailure::Timeout)) => {
                CapabilityOutcome::Timeout { elapsed_ms }
            }
            Err(BreakerError::Inner(RunFailure::Invocation(error))) => CapabilityOutcome::Failed {
                message: error.message,
            },
        };

        let kind = match &outcome {
            CapabilityOutcome::Timeout { .. } => EventKind::CapabilityTimeout,
            _ => EventKind::CapabilityComplete,
        };
        self.bus.publish(
            Event::new(kind, ctx.correlation().as_str())
                .with_field("family", family.as_str())
                .with_field("name", name)
                .with_field("elapsed_ms", elapsed_ms)
                .with_field("ok", outcome.is_ok()),
        );
        Ok(outcome)
    }
}

enum RunFailure {
    Timeout,
    Invocation(CapabilityError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutSettings;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    impl Capability for Echo {
        fn run(
            &self,
            input: Value,
            _ctx: &RequestContext,
        ) -> CapabilityFuture {
            Box::pin(async move { Ok(json!({ "echoed": input })) })
        }
    }

    struct Hang;

    impl Capability for Hang {
        fn run(
            &self,
            _input: Value,
            _ctx: &RequestContext,
        ) -> CapabilityFuture {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Value::Null)
            })
        }
    }

    struct Boom;

    impl Capability for Boom {
        fn run(
            &self,
            _input: Value,
            _ctx: &RequestContext,
        ) -> CapabilityFuture {
            Box::pin(async { Err(CapabilityError::new("lint exploded")) })
        }
    }

    fn descriptor(name: &str, family: CapabilityFamily) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: name.to_string(),
            family,
            version: "1.0.0".to_string(),
            input_kind: "json".to_string(),
            output_kind: "json".to_string(),
            default_timeout_level: TimeoutLevel::Complex,
        }
    }

    fn dispatcher(registry: CapabilityRegistry, settings: BreakerSettings) -> CapabilityDispatcher {
        CapabilityDispatcher::new(
            registry,
            settings,
            Timeouts::from_settings(&TimeoutSettings::default()),
            EventBus::new(),
        )
    }

    #[tokio::test]
    async fn dispatch_runs_registered_capability() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(descriptor("echo", CapabilityFamily::Analyzer), Arc::new(Echo))
            .expect("register");
        let dispatcher = dispatcher(registry, BreakerSettings::default());

        let outcome = dispatcher
            .run(
                CapabilityFamily::Analyzer,
                "echo",
                json!({"q": 1}),
                &RequestContext::new(),
                None,
            )
            .await
            .expect("dispatch");
        match outcome {
            CapabilityOutcome::Ok(value) => assert_eq!(value, json!({"echoed": {"q": 1}})),
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_capability_is_bad_request() {
        let dispatcher = dispatcher(CapabilityRegistry::new(), BreakerSettings::default());
        let error = dispatcher
            .run(
                CapabilityFamily::Checker,
                "ghost",
                Value::Null,
                &RequestContext::new(),
                None,
            )
            .await
            .expect_err("unknown");
        assert!(error.is_bad_request());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(descriptor("echo", CapabilityFamily::Analyzer), Arc::new(Echo))
            .expect("first");
        let error = registry
            .register(descriptor("echo", CapabilityFamily::Analyzer), Arc::new(Echo))
            .expect_err("duplicate");
        assert!(matches!(error, RegistryError::Duplicate { .. }));
        // Same name under another family is a different key.
        registry
            .register(descriptor("echo", CapabilityFamily::Converter), Arc::new(Echo))
            .expect("other family");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_capability_times_out() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(descriptor("hang", CapabilityFamily::Monitor), Arc::new(Hang))
            .expect("register");
        let dispatcher = dispatcher(registry, BreakerSettings::default());

        let outcome = dispatcher
            .run(
                CapabilityFamily::Monitor,
                "hang",
                Value::Null,
                &RequestContext::new(),
                Some(50),
            )
            .await
            .expect("dispatch");
        assert!(matches!(outcome, CapabilityOutcome::Timeout { .. }));
    }

    #[tokio::test]
    async fn failures_trip_only_their_family_breaker() {
        let mut registry = CapabilityRegistry::new();
        registry
            .register(descriptor("boom", CapabilityFamily::Checker), Arc::new(Boom))
            .expect("boom");
        registry
            .register(descriptor("echo", CapabilityFamily::Analyzer), Arc::new(Echo))
            .expect("echo");
        let dispatcher = dispatcher(
            registry,
            BreakerSettings {
                failure_threshold: 2,
                reset_timeout_ms: 60_000,
                half_open_requests: 1,
            },
        );
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let outcome = dispatcher
                .run(CapabilityFamily::Checker, "boom", Value::Null, &ctx, None)
                .await
                .expect("dispatch");
            assert!(matches!(outcome, CapabilityOutcome::Failed { .. }));
        }
        let outcome = dispatcher
            .run(CapabilityFamily::Checker, "boom", Value::Null, &ctx, None)
            .await
            .expect("dispatch");
        assert!(matches!(outcome, CapabilityOutcome::CircuitOpen));

        // The analyzer family is unaffected.
        let outcome = dispatcher
            .run(CapabilityFamily::Analyzer, "echo", json!(1), &ctx, None)
            .await
            .expect("dispatch");
        assert!(outcome.is_ok());
    }
}
