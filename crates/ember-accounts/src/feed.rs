//! Event fan-out with per-subscriber queues.
//!
//! A [`Feed`] delivers every sent event to every live subscriber sink.
//! Sinks are bounded channels by convention: a full sink stalls only the
//! broadcast step of the producer, never its internal state update. A
//! disconnected sink is pruned on the next send. Broadcasts are serialized
//! with each other, but subscribing and unsubscribing never wait on an
//! in-flight delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Receiving end a feed can deliver into.
///
/// Returns `false` when the sink is permanently gone, at which point the
/// feed drops the subscription.
pub trait EventSink<T>: Send {
    fn deliver(&self, event: T) -> bool;
}

impl<T: Send> EventSink<T> for mpsc::Sender<T> {
    fn deliver(&self, event: T) -> bool {
        self.send(event).is_ok()
    }
}

impl<T: Send> EventSink<T> for mpsc::SyncSender<T> {
    fn deliver(&self, event: T) -> bool {
        self.send(event).is_ok()
    }
}

struct FeedInner<T> {
    next_id: u64,
    sinks: Vec<(u64, Box<dyn EventSink<T>>)>,
    /// Ids detached while their sink was out with an in-flight broadcast.
    detached: Vec<u64>,
    /// Ids pruned as disconnected, awaiting their subscription's detach.
    gone: Vec<u64>,
}

struct FeedShared<T> {
    /// Serializes broadcasts so concurrent sends cannot interleave a
    /// half-delivered sink set.
    send_lock: Mutex<()>,
    inner: Mutex<FeedInner<T>>,
    subscribers: AtomicUsize,
}

impl<T> FeedShared<T> {
    fn lock(&self) -> MutexGuard<'_, FeedInner<T>> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn detach(&self, id: u64) {
        let mut inner = self.lock();
        let before = inner.sinks.len();
        inner.sinks.retain(|(sid, _)| *sid != id);
        if inner.sinks.len() < before {
            self.subscribers.fetch_sub(1, Ordering::Relaxed);
        } else if let Some(at) = inner.gone.iter().position(|gid| *gid == id) {
            // Already pruned as disconnected; the count was adjusted then.
            inner.gone.swap_remove(at);
        } else {
            // The sink is out with an in-flight broadcast; flag it so the
            // reconciliation drops it.
            inner.detached.push(id);
            self.subscribers.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// One-to-many event feed.
///
/// Cloning a feed is cheap and yields another handle on the same subscriber
/// set.
pub struct Feed<T> {
    shared: Arc<FeedShared<T>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: 'static> Default for Feed<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Feed<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(FeedShared {
                send_lock: Mutex::new(()),
                inner: Mutex::new(FeedInner {
                    next_id: 0,
                    sinks: Vec::new(),
                    detached: Vec::new(),
                    gone: Vec::new(),
                }),
                subscribers: AtomicUsize::new(0),
            }),
        }
    }

    /// Attach a sink. The subscription detaches it when unsubscribed or
    /// dropped.
    pub fn subscribe(&self, sink: Box<dyn EventSink<T>>) -> Subscription {
        let id = {
            let mut inner = self.shared.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.sinks.push((id, sink));
            id
        };
        self.shared.subscribers.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.shared);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.detach(id);
                }
            })),
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::Relaxed)
    }
}

impl<T: Clone + Send> Feed<T> {
    /// Deliver an event to every subscriber, pruning disconnected sinks.
    /// Returns the number of sinks the event reached.
    ///
    /// Delivery happens outside the subscriber lock: a sink blocking on a
    /// full queue stalls this broadcast, but never `subscribe` or
    /// `unsubscribe`.
    pub fn send(&self, event: T) -> usize {
        let _broadcast = self
            .shared
            .send_lock
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());

        let mut batch = std::mem::take(&mut self.shared.lock().sinks);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sink) in &batch {
            if sink.deliver(event.clone()) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }

        let mut inner = self.shared.lock();
        for id in &dead {
            self.shared.subscribers.fetch_sub(1, Ordering::Relaxed);
            inner.gone.push(*id);
        }
        let detached = std::mem::take(&mut inner.detached);
        batch.retain(|(id, _)| !dead.contains(id) && !detached.contains(id));
        // Sinks subscribed during the delivery sit in `inner.sinks` already;
        // keep them behind the surviving batch.
        let newcomers = std::mem::take(&mut inner.sinks);
        inner.sinks = batch;
        inner.sinks.extend(newcomers);

        delivered
    }
}

/// Handle detaching one subscriber from its feed. Detaches on drop as well.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
