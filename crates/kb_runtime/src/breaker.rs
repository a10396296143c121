//! Named, scoped circuit breakers.
//!
//! One breaker guards one resource (`io.content`, `capability.checker`, …);
//! state is never shared across scopes. Transitions follow the classic
//! three-state machine: `Closed` trips to `Open` after a run of consecutive
//! failures, `Open` fails fast until the reset timeout, then `HalfOpen`
//! admits a bounded number of concurrent probes whose collective success
//! re-closes the circuit.
//!
//! Rejection is a typed outcome, not an exception: callers receive
//! [`BreakerError::Open`] and decide whether to substitute fallback content.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

use kb_events::{Event, EventBus, EventKind};

use crate::config::BreakerSettings;
use crate::context::CorrelationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn tag(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Outcome of a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit rejected the call without invoking the operation.
    #[error("circuit `{scope}` is open")]
    Open { scope: String },
    /// The operation ran and failed; the failure has been counted.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

struct BreakerCore {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    half_open_inflight: u32,
}

pub struct CircuitBreaker {
    scope: String,
    settings: BreakerSettings,
    state_tag: AtomicU8,
    core: Mutex<BreakerCore>,
    bus: EventBus,
}

/// Admission ticket for one guarded call, held across the operation. A call
/// settles it with exactly one success or failure vote; if the guarded
/// future is dropped first (caller cancellation), `Drop` releases any
/// half-open slot without voting either way.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    correlation: &'a CorrelationId,
    probe: bool,
    settled: bool,
}

impl PermitGuard<'_> {
    fn settle_success(&mut self) {
        if !self.settled {
            self.settled = true;
            self.breaker.record_success(self.probe, self.correlation);
        }
    }

    fn settle_failure(&mut self) {
        if !self.settled {
            self.settled = true;
            self.breaker.record_failure(self.probe, self.correlation);
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            self.breaker.release_slot(self.probe);
        }
    }
}

impl CircuitBreaker {
    pub fn new(scope: impl Into<String>, settings: BreakerSettings, bus: EventBus) -> Self {
        Self {
            scope: scope.into(),
            settings,
            state_tag: AtomicU8::new(BreakerState::Closed.tag()),
            core: Mutex::new(BreakerCore {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_successes: 0,
                half_open_inflight: 0,
            }),
            bus,
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Lock-free state read; may trail an in-flight transition.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_tag(self.state_tag.load(Ordering::Acquire))
    }

    /// Runs `op` under the breaker. `Err(Open)` means the operation was
    /// never invoked. A dropped future (caller cancellation) neither counts
    /// as success nor failure.
    pub async fn call<T, E, F, Fut>(
        &self,
        correlation: &CorrelationId,
        op: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let probe = match self.try_acquire(correlation) {
            Some(probe) => probe,
            None => {
                return Err(BreakerError::Open {
                    scope: self.scope.clone(),
                })
            }
        };
        let mut guard = PermitGuard {
            breaker: self,
            correlation,
            probe,
            settled: false,
        };
        match op().await {
            Ok(value) => {
                guard.settle_success();
                Ok(value)
            }
            Err(error) => {
                guard.settle_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Admission check; `Some(is_probe)` grants the call, `None` rejects it.
    fn try_acquire(&self, correlation: &CorrelationId) -> Option<bool> {
        let mut core = self.core.lock().expect("breaker core poisoned");
        match core.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|at| at.elapsed() >= Duration::from_millis(self.settings.reset_timeout_ms))
                    .unwrap_or(true);
                if !elapsed {
                    return None;
                }
                self.transition(&mut core, BreakerState::HalfOpen, correlation);
                core.half_open_successes = 0;
                core.half_open_inflight = 1;
                Some(true)
            }
            BreakerState::HalfOpen => {
                if core.half_open_inflight >= self.settings.half_open_requests {
                    return None;
                }
                core.half_open_inflight += 1;
                Some(true)
            }
        }
    }

    fn record_success(&self, probe: bool, correlation: &CorrelationId) {
        let mut core = self.core.lock().expect("breaker core poisoned");
        if probe {
            core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
        }
        match core.state {
            BreakerState::Closed => core.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                core.half_open_successes += 1;
                if core.half_open_successes >= self.settings.half_open_requests {
                    self.transition(&mut core, BreakerState::Closed, correlation);
                    core.consecutive_failures = 0;
                    core.half_open_successes = 0;
                    core.opened_at = None;
                }
            }
            // A probe that outlived a concurrent re-open; its vote is void.
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self, probe: bool, correlation: &CorrelationId) {
        let mut core = self.core.lock().expect("breaker core poisoned");
        if probe {
            core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
        }
        match core.state {
            BreakerState::Closed => {
                core.consecutive_failures += 1;
                if core.consecutive_failures >= self.settings.failure_threshold {
                    self.transition(&mut core, BreakerState::Open, correlation);
                    core.opened_at = Some(Instant::now());
                }
            }
            BreakerState::HalfOpen => {
                self.transition(&mut core, BreakerState::Open, correlation);
                core.opened_at = Some(Instant::now());
                core.half_open_successes = 0;
            }
            BreakerState::Open => {
                // Late failure from a pre-open call; the timer already runs.
            }
        }
    }

    fn release_slot(&self, probe: bool) {
        if probe {
            let mut core = self.core.lock().expect("breaker core poisoned");
            core.half_open_inflight = core.half_open_inflight.saturating_sub(1);
        }
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState, correlation: &CorrelationId) {
        if core.state == to {
            return;
        }
        debug!(
            scope = %self.scope,
            from = core.state.as_str(),
            to = to.as_str(),
            "breaker transition"
        );
        core.state = to;
        self.state_tag.store(to.tag(), Ordering::Release);
        let kind = match to {
            BreakerState::Open => EventKind::BreakerOpen,
            BreakerState::HalfOpen => EventKind::BreakerHalfOpen,
            BreakerState::Closed => EventKind::BreakerClose,
        };
        self.bus
            .publish(Event::new(kind, correlation.as_str()).with_field("scope", self.scope.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 2,
            reset_timeout_ms: 1_000,
            half_open_requests: 2,
        }
    }

    fn breaker(bus: EventBus) -> CircuitBreaker {
        CircuitBreaker::new("io.content", settings(), bus)
    }

    async fn fail(b: &CircuitBreaker, corr: &CorrelationId) -> Result<(), BreakerError<&'static str>> {
        b.call(corr, || async { Err::<(), _>("boom") }).await.map(|_| ())
    }

    async fn succeed(b: &CircuitBreaker, corr: &CorrelationId) -> Result<(), BreakerError<&'static str>> {
        b.call(corr, || async { Ok::<_, &'static str>(()) }).await.map(|_| ())
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let b = breaker(bus.clone());
        let corr = CorrelationId::generate();

        assert!(matches!(fail(&b, &corr).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(matches!(fail(&b, &corr).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), BreakerState::Open);

        // Fail fast: the operation is not invoked.
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let outcome = b
            .call(&corr, || async {
                invoked.store(true, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await;
        assert!(matches!(outcome, Err(BreakerError::Open { .. })));
        assert!(!invoked.load(Ordering::SeqCst));

        let opened: Vec<_> = events
            .drain()
            .into_iter()
            .filter(|e| e.kind == EventKind::BreakerOpen)
            .collect();
        assert_eq!(opened.len(), 1, "breaker.open emitted exactly once");
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let b = breaker(EventBus::new());
        let corr = CorrelationId::generate();
        assert!(fail(&b, &corr).await.is_err());
        assert!(succeed(&b, &corr).await.is_ok());
        assert!(fail(&b, &corr).await.is_err());
        // Two failures total but never two consecutive: still closed.
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_requires_exactly_the_configured_successes() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let b = breaker(bus.clone());
        let corr = CorrelationId::generate();

        fail(&b, &corr).await.ok();
        fail(&b, &corr).await.ok();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(succeed(&b, &corr).await.is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen, "one success is not enough");
        assert!(succeed(&b, &corr).await.is_ok());
        assert_eq!(b.state(), BreakerState::Closed);

        let kinds: Vec<_> = events.drain().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::BreakerHalfOpen));
        assert!(kinds.contains(&EventKind::BreakerClose));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_resets_timer() {
        let b = breaker(EventBus::new());
        let corr = CorrelationId::generate();
        fail(&b, &corr).await.ok();
        fail(&b, &corr).await.ok();

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert!(matches!(fail(&b, &corr).await, Err(BreakerError::Inner(_))));
        assert_eq!(b.state(), BreakerState::Open);

        // The reset timer restarted: still failing fast just before it runs
        // out again.
        tokio::time::advance(Duration::from_millis(900)).await;
        assert!(matches!(
            succeed(&b, &corr).await,
            Err(BreakerError::Open { .. })
        ));
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(succeed(&b, &corr).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_bounds_concurrent_probes() {
        let b = std::sync::Arc::new(breaker(EventBus::new()));
        let corr = CorrelationId::generate();
        fail(&b, &corr).await.ok();
        fail(&b, &corr).await.ok();
        tokio::time::advance(Duration::from_millis(1_001)).await;

        // Two slow probes occupy both half-open slots.
        let (gate_tx, gate_rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let b = std::sync::Arc::clone(&b);
            let corr = corr.clone();
            let mut gate = gate_rx.clone();
            probes.push(tokio::spawn(async move {
                b.call(&corr, move || async move {
                    while !*gate.borrow_and_update() {
                        if gate.changed().await.is_err() {
                            break;
                        }
                    }
                    Ok::<_, &'static str>(())
                })
                .await
                .is_ok()
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // A third call is rejected while both probes are in flight.
        assert!(matches!(
            succeed(&b, &corr).await,
            Err(BreakerError::Open { .. })
        ));

        gate_tx.send(true).expect("open gate");
        for probe in probes {
            assert!(probe.await.expect("probe task"));
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_its_slot() {
        let b = std::sync::Arc::new(breaker(EventBus::new()));
        let corr = CorrelationId::generate();
        fail(&b, &corr).await.ok();
        fail(&b, &corr).await.ok();
        tokio::time::advance(Duration::from_millis(1_001)).await;

        {
            let b = std::sync::Arc::clone(&b);
            let corr = corr.clone();
            let hung = tokio::spawn(async move {
                b.call(&corr, || async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, &'static str>(())
                })
                .await
                .ok();
            });
            tokio::task::yield_now().await;
            hung.abort();
            let _ = hung.await;
        }

        // The aborted probe's slot is free again; two clean successes close.
        assert!(succeed(&b, &corr).await.is_ok());
        assert!(succeed(&b, &corr).await.is_ok());
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
