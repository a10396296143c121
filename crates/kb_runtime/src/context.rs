//! Monotonic deadlines, cancellation, and per-request correlation.
//!
//! Every operation that may block takes a [`RequestContext`] and must return
//! promptly once its deadline elapses or its [`CancelToken`] fires. Child
//! contexts only ever tighten the parent deadline.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio::time::Instant;

/// A monotonic point in time by which an operation must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(duration: Duration) -> Self {
        Deadline(Instant::now() + duration)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(instant)
    }

    pub fn instant(&self) -> Instant {
        self.0
    }

    /// The tighter of the two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        Deadline(self.0.min(other.0))
    }

    /// Time left before expiry; zero once elapsed.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// Cheap clonable cancellation handle shared across a request tree.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Process-unique request identifier carried on every event and result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        static SEED: OnceLock<u64> = OnceLock::new();
        let seed = *SEED.get_or_init(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| u64::try_from(d.as_nanos() & u128::from(u64::MAX)).unwrap_or(0))
                .unwrap_or(0)
        });
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        CorrelationId(format!("{:016x}", seed.wrapping_add(count.wrapping_mul(0x9e37_79b9_7f4a_7c15))))
    }

    pub fn from_string(raw: impl Into<String>) -> Self {
        CorrelationId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ambient value threaded through every blocking call: deadline, correlation
/// id, and cancellation signal.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Deadline>,
    correlation: CorrelationId,
    cancel: CancelToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            deadline: None,
            correlation: CorrelationId::generate(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_deadline(deadline: Deadline) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    pub fn with_parts(
        deadline: Option<Deadline>,
        correlation: CorrelationId,
        cancel: CancelToken,
    ) -> Self {
        Self {
            deadline,
            correlation,
            cancel,
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn correlation(&self) -> &CorrelationId {
        &self.correlation
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline.map(|d| d.is_elapsed()).unwrap_or(false)
    }

    /// Child context inheriting the tighter of the parent deadline and
    /// `deadline`. Correlation and cancellation are shared.
    pub fn child(&self, deadline: Deadline) -> Self {
        let tightened = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(tightened),
            correlation: self.correlation.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_unique() {
        let a = CorrelationId::generate();
        let b = CorrelationId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[tokio::test]
    async fn child_deadline_only_tightens() {
        let parent = RequestContext::with_deadline(Deadline::after(Duration::from_millis(50)));
        let child = parent.child(Deadline::after(Duration::from_secs(60)));
        // The child asked for a looser deadline and did not get it.
        assert!(child.deadline().unwrap().remaining() <= Duration::from_millis(50));

        let tighter = parent.child(Deadline::after(Duration::from_millis(5)));
        assert!(tighter.deadline().unwrap().remaining() <= Duration::from_millis(5));
        assert_eq!(child.correlation(), parent.correlation());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.expect("waiter"));
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapses() {
        let deadline = Deadline::after(Duration::from_millis(10));
        assert!(!deadline.is_elapsed());
        tokio::time::advance(Duration::from_millis(11)).await;
        assert!(deadline.is_elapsed());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }
}
