//! In-memory stores and live fanout.
//!
//! Each substore keeps a bounded ring of recent items plus a set of
//! subscriptions.  A subscription is a value record with a bounded outgoing
//! queue; the fanout enumerates matching records under a read guard, then
//! sends outside it.  Delivery to a single subscriber preserves `add()`
//! order.  Overflow policy: when a subscriber's queue is full the incoming
//! item is dropped for that subscriber and counted — a slow consumer never
//! blocks `add()` or its peers.

use roast_protocol::{Envelope, StreamFilter};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;

use crate::repo::events::EventRow;
use crate::repo::points::SampleRow;

/// Per-subscription queue depth before items are dropped for that consumer.
const SUBSCRIPTION_QUEUE_DEPTH: usize = 256;

/// Ring capacity for `query()` over recent items.
const RING_CAPACITY: usize = 1024;

/// Items that can be routed by origin.
pub trait Routed: Clone + Send + 'static {
    fn org_id(&self) -> &str;
    fn site_id(&self) -> &str;
    fn machine_id(&self) -> &str;
}

impl Routed for SampleRow {
    fn org_id(&self) -> &str {
        &self.org_id
    }
    fn site_id(&self) -> &str {
        &self.site_id
    }
    fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

impl Routed for EventRow {
    fn org_id(&self) -> &str {
        &self.org_id
    }
    fn site_id(&self) -> &str {
        &self.site_id
    }
    fn machine_id(&self) -> &str {
        &self.machine_id
    }
}

impl Routed for Envelope {
    fn org_id(&self) -> &str {
        &self.origin.org_id
    }
    fn site_id(&self) -> &str {
        &self.origin.site_id
    }
    fn machine_id(&self) -> &str {
        &self.origin.machine_id
    }
}

fn matches<T: Routed>(filter: &StreamFilter, item: &T) -> bool {
    filter.matches_parts(item.org_id(), item.site_id(), item.machine_id())
}

struct SubEntry<T> {
    id: u64,
    filter: StreamFilter,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

struct Inner<T> {
    ring: Mutex<VecDeque<T>>,
    capacity: usize,
    subs: RwLock<Vec<SubEntry<T>>>,
    next_id: AtomicU64,
}

/// One substore: recent-item ring + filtered subscriptions.
pub struct LiveStore<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for LiveStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Routed> Default for LiveStore<T> {
    fn default() -> Self {
        Self::new(RING_CAPACITY)
    }
}

impl<T: Routed> LiveStore<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                ring: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
                capacity,
                subs: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Append to the ring and fan out to every matching subscriber.
    pub fn add(&self, item: T) {
        {
            let mut ring = self.inner.ring.lock().unwrap_or_else(|e| e.into_inner());
            if ring.len() == self.inner.capacity {
                ring.pop_front();
            }
            ring.push_back(item.clone());
        }

        // Hold the read guard only to enumerate; sends happen outside it.
        let targets: Vec<(mpsc::Sender<T>, Arc<AtomicU64>)> = {
            let subs = self.inner.subs.read().unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|entry| matches(&entry.filter, &item))
                .map(|entry| (entry.tx.clone(), Arc::clone(&entry.dropped)))
                .collect()
        };
        for (tx, dropped) in targets {
            if tx.try_send(item.clone()).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Recent items matching the filter, newest first.
    pub fn query(&self, filter: &StreamFilter, limit: usize) -> Vec<T> {
        let ring = self.inner.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.iter()
            .rev()
            .filter(|item| matches(filter, *item))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Register a subscription.  Dropping the returned handle unsubscribes;
    /// a send racing the drop lands in a closed queue and is never observed.
    pub fn subscribe(&self, filter: StreamFilter) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        {
            let mut subs = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
            subs.push(SubEntry {
                id,
                filter,
                tx,
                dropped: Arc::clone(&dropped),
            });
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
            rx,
            dropped,
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner
            .subs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// A live subscription; lifetime equals the consumer's connection.
pub struct Subscription<T> {
    inner: Arc<Inner<T>>,
    id: u64,
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Items dropped for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let mut subs = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|entry| entry.id != self.id);
    }
}

/// The service's four live substores: stored telemetry and events, plus the
/// full trust-annotated envelope feeds per topic.
#[derive(Clone, Default)]
pub struct LiveFeeds {
    pub telemetry: LiveStore<SampleRow>,
    pub events: LiveStore<EventRow>,
    pub telemetry_envelopes: LiveStore<Envelope>,
    pub event_envelopes: LiveStore<Envelope>,
}
