//! The five named timeout levels and deadline composition.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TimeoutSettings;
use crate::context::Deadline;

/// The canonical timeout hierarchy. Each level bounds one class of work;
/// configured durations must satisfy T1 ≤ T2 ≤ T3 ≤ T4 ≤ T5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutLevel {
    /// T1: cache lookups.
    Cache,
    /// T2: a single file read.
    File,
    /// T3: one layer, including its index resolution.
    Layer,
    /// T4: a full load request.
    Full,
    /// T5: complex analysis (capabilities).
    Complex,
}

impl TimeoutLevel {
    pub const ALL: [TimeoutLevel; 5] = [
        TimeoutLevel::Cache,
        TimeoutLevel::File,
        TimeoutLevel::Layer,
        TimeoutLevel::Full,
        TimeoutLevel::Complex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutLevel::Cache => "cache",
            TimeoutLevel::File => "file",
            TimeoutLevel::Layer => "layer",
            TimeoutLevel::Full => "full",
            TimeoutLevel::Complex => "complex",
        }
    }
}

/// Raised by [`Timeouts::run`] when the deadline elapses first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

/// Resolved timeout table. Constructed from validated [`TimeoutSettings`];
/// every duration is already clamped to the absolute maximum.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    cache: Duration,
    file: Duration,
    layer: Duration,
    full: Duration,
    complex: Duration,
    absolute_max: Duration,
}

impl Timeouts {
    pub(crate) fn from_settings(settings: &TimeoutSettings) -> Self {
        Self {
            cache: Duration::from_millis(settings.cache_ms),
            file: Duration::from_millis(settings.file_ms),
            layer: Duration::from_millis(settings.layer_ms),
            full: Duration::from_millis(settings.full_ms),
            complex: Duration::from_millis(settings.complex_ms),
            absolute_max: Duration::from_millis(settings.absolute_max_ms),
        }
    }

    pub fn duration(&self, level: TimeoutLevel) -> Duration {
        match level {
            TimeoutLevel::Cache => self.cache,
            TimeoutLevel::File => self.file,
            TimeoutLevel::Layer => self.layer,
            TimeoutLevel::Full => self.full,
            TimeoutLevel::Complex => self.complex,
        }
    }

    pub fn absolute_max(&self) -> Duration {
        self.absolute_max
    }

    /// Effective deadline for one call: `min(parent, configured level,
    /// override)`, with the override clamped to the absolute maximum.
    pub fn deadline(
        &self,
        level: TimeoutLevel,
        override_ms: Option<u64>,
        parent: Option<Deadline>,
    ) -> Deadline {
        let mut effective = self.duration(level);
        if let Some(ms) = override_ms {
            let requested = Duration::from_millis(ms.max(1));
            effective = requested.min(self.absolute_max);
        }
        let deadline = Deadline::after(effective);
        match parent {
            Some(parent) => parent.min(deadline),
            None => deadline,
        }
    }

    /// Runs `fut` until `deadline`. The future is cancelled cooperatively by
    /// being dropped when the deadline hits.
    pub async fn run<T>(
        &self,
        deadline: Deadline,
        fut: impl Future<Output = T>,
    ) -> Result<T, DeadlineExceeded> {
        tokio::time::timeout_at(deadline.instant(), fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }
}
