#![forbid(unsafe_code)]
//! In-process publish/subscribe bus for knowledge-runtime lifecycle events.
//!
//! Every stage of a load emits an [`Event`] drawn from the closed [`EventKind`]
//! vocabulary. Delivery is best-effort and fully decoupled from the publisher:
//! - Publishing never blocks and never fails. Subscriber panics or slowness
//!   cannot propagate back into the load path.
//! - Each subscriber owns a bounded queue. When a queue overflows, the oldest
//!   events are dropped and the gap is surfaced to that subscriber as a
//!   [`EventKind::BusDrop`] event carrying the running drop count.
//! - A bus built with [`EventBus::disabled`] turns every publish into a no-op,
//!   so callers can thread one handle unconditionally.

mod bus;
mod event;

pub use bus::{EventBus, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};
pub use event::{Event, EventKind};
