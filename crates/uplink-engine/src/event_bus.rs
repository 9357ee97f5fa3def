//! Event bus between workers and the shell
//!
//! Workers publish immutable [`TransferEvent`]s; the shell drains them from
//! an [`EventStream`]. Publishing never blocks: once the buffer reaches its
//! capacity, the oldest buffered progress event is dropped to make room.
//! Status, error, and completion events are never dropped, so the buffer
//! may temporarily exceed its capacity by the number of such events.
//!
//! Dropping a progress event never reorders the remaining events, so the
//! per-job order seen by the consumer is the order of production.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use uplink_core::TransferEvent;

/// Default buffer capacity
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct BusStats {
    published: AtomicU64,
    delivered: AtomicU64,
    coalesced: AtomicU64,
}

struct Shared {
    queue: Mutex<VecDeque<TransferEvent>>,
    capacity: usize,
    notify: Notify,
    senders: AtomicUsize,
    stats: BusStats,
}

/// Create a bus with the given capacity
pub fn channel(capacity: usize) -> (EventBus, EventStream) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        capacity: capacity.max(1),
        notify: Notify::new(),
        senders: AtomicUsize::new(1),
        stats: BusStats::default(),
    });
    (
        EventBus {
            shared: shared.clone(),
        },
        EventStream { shared },
    )
}

/// Producer handle; cheap to clone
pub struct EventBus {
    shared: Arc<Shared>,
}

impl EventBus {
    /// Queue an event without blocking
    pub fn publish(&self, event: TransferEvent) {
        let shared = &self.shared;
        shared.stats.published.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = shared.queue.lock();
            if queue.len() >= shared.capacity {
                match queue.iter().position(TransferEvent::is_coalescable) {
                    Some(oldest) => {
                        queue.remove(oldest);
                        shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    None if event.is_coalescable() => {
                        // Buffer holds only events that must be delivered
                        shared.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    None => {}
                }
            }
            queue.push_back(event);
        }
        shared.notify.notify_one();
    }

    /// Events currently buffered
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> EventBusStatsSnapshot {
        snapshot(&self.shared)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!("Event bus closed");
            self.shared.notify.notify_one();
        }
    }
}

/// Consumer handle held by the shell
pub struct EventStream {
    shared: Arc<Shared>,
}

impl EventStream {
    /// Next event, waiting if none is buffered.
    ///
    /// Returns `None` once every [`EventBus`] handle is dropped and the
    /// buffer is drained.
    pub async fn recv(&mut self) -> Option<TransferEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.senders.load(Ordering::Acquire) == 0 {
                return self.try_recv();
            }
            self.shared.notify.notified().await;
        }
    }

    /// Next buffered event, if any
    pub fn try_recv(&mut self) -> Option<TransferEvent> {
        let event = self.shared.queue.lock().pop_front();
        if event.is_some() {
            self.shared.stats.delivered.fetch_add(1, Ordering::Relaxed);
        }
        event
    }

    /// Take everything currently buffered
    pub fn drain(&mut self) -> Vec<TransferEvent> {
        let events: Vec<_> = self.shared.queue.lock().drain(..).collect();
        self.shared
            .stats
            .delivered
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        events
    }

    /// Get statistics snapshot
    pub fn stats(&self) -> EventBusStatsSnapshot {
        snapshot(&self.shared)
    }
}

fn snapshot(shared: &Shared) -> EventBusStatsSnapshot {
    EventBusStatsSnapshot {
        published: shared.stats.published.load(Ordering::Relaxed),
        delivered: shared.stats.delivered.load(Ordering::Relaxed),
        coalesced: shared.stats.coalesced.load(Ordering::Relaxed),
        buffered: shared.queue.lock().len(),
    }
}

/// Snapshot of event bus statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    /// Progress events dropped under backpressure
    pub coalesced: u64,
    pub buffered: usize,
}
