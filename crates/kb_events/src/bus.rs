use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::event::{Event, EventKind};

/// Queue depth handed to [`EventBus::subscribe`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Fan-out bus. Cloning shares the subscriber set.
#[derive(Clone)]
pub struct EventBus {
    inner: Option<Arc<BusInner>>,
}

struct BusInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    dropped: AtomicU64,
}

struct SubscriberQueue {
    events: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    detached: AtomicBool,
}

struct QueueState {
    events: VecDeque<Event>,
    /// Events dropped since this subscriber last received; surfaced as a
    /// synthetic `bus.drop` event ahead of the next delivery.
    pending_drops: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                dropped: AtomicU64::new(0),
            })),
        }
    }

    /// A bus whose `publish` is a no-op. Subscriptions created on it never
    /// yield events.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let Some(inner) = &self.inner else {
            return Subscription { queue: None };
        };
        let queue = Arc::new(SubscriberQueue {
            events: Mutex::new(QueueState {
                events: VecDeque::new(),
                pending_drops: 0,
            }),
            capacity: capacity.max(1),
            notify: Notify::new(),
            detached: AtomicBool::new(false),
        });
        inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(Arc::clone(&queue));
        Subscription { queue: Some(queue) }
    }

    /// Delivers `event` to every live subscriber without blocking. Overflowing
    /// queues shed their oldest entries; the shed count is accounted globally
    /// and replayed to the affected subscriber as a `bus.drop` event.
    pub fn publish(&self, event: Event) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut subscribers = inner
            .subscribers
            .lock()
            .expect("subscriber list poisoned");
        subscribers.retain(|queue| !queue.detached.load(Ordering::Acquire));
        for queue in subscribers.iter() {
            let dropped = queue.push(event.clone());
            if dropped > 0 {
                inner.dropped.fetch_add(dropped, Ordering::Relaxed);
            }
        }
    }

    /// Total events shed across all subscribers since construction.
    pub fn dropped_events(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|inner| inner.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberQueue {
    /// Enqueues an event, shedding from the front when full. Returns how many
    /// events were shed.
    fn push(&self, event: Event) -> u64 {
        let mut state = self.events.lock().expect("subscriber queue poisoned");
        let mut shed = 0;
        while state.events.len() >= self.capacity {
            state.events.pop_front();
            shed += 1;
        }
        state.events.push_back(event);
        state.pending_drops += shed;
        drop(state);
        self.notify.notify_one();
        shed
    }

    fn pop(&self) -> Option<Event> {
        let mut state = self.events.lock().expect("subscriber queue poisoned");
        if state.pending_drops > 0 {
            let count = state.pending_drops;
            state.pending_drops = 0;
            // Correlation is meaningless for a gap marker.
            return Some(Event::new(EventKind::BusDrop, "bus").with_field("dropped", count));
        }
        state.events.pop_front()
    }
}

/// Receiving side of a subscription. Dropping it detaches from the bus.
pub struct Subscription {
    queue: Option<Arc<SubscriberQueue>>,
}

impl Subscription {
    /// Waits for the next event. Returns `None` only for subscriptions made
    /// on a disabled bus.
    pub async fn recv(&mut self) -> Option<Event> {
        let queue = self.queue.as_ref()?;
        loop {
            if let Some(event) = queue.pop() {
                return Some(event);
            }
            queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.as_ref()?.pop()
    }

    /// Drains everything currently queued.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Some(event) = self.try_recv() {
            drained.push(event);
        }
        drained
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(queue) = &self.queue {
            queue.detached.store(true, Ordering::Release);
        }
    }
}
