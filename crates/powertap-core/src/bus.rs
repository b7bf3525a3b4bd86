//! Single-producer, multi-consumer hand-off for power samples.
//!
//! Consumers want different things. A live gauge only cares about "now" and
//! reads [`SampleBus::consume_latest`]. A statistics or logging consumer
//! needs every tick in capture order and holds a [`Subscription`], which has
//! its own bounded FIFO. The producer calls [`SampleBus::publish`] and never
//! blocks: a full subscription drops its oldest sample and counts the drop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::sample::PowerSample;

/// Default per-subscription queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

struct Queue {
    samples: Mutex<VecDeque<PowerSample>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl Queue {
    fn push(&self, sample: PowerSample) {
        let mut q = self.samples.lock().unwrap();
        if q.len() == self.capacity {
            q.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        q.push_back(sample);
        drop(q);
        self.ready.notify_all();
    }
}

struct Shared {
    latest: Mutex<Option<PowerSample>>,
    subscribers: Mutex<Vec<Weak<Queue>>>,
    published: AtomicU64,
    closed: AtomicBool,
}

/// Thread-safe sample bus. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct SampleBus {
    shared: Arc<Shared>,
}

impl Default for SampleBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SampleBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBus")
            .field("published", &self.published())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SampleBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                latest: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                published: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish a sample to every live subscription and the latest slot.
    /// Never blocks on consumers. Returns `false` once the bus is closed.
    pub fn publish(&self, sample: PowerSample) -> bool {
        if self.is_closed() {
            return false;
        }
        *self.shared.latest.lock().unwrap() = Some(sample);

        let mut subs = self.shared.subscribers.lock().unwrap();
        subs.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(sample);
                true
            }
            None => false,
        });
        drop(subs);

        self.shared.published.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The most recent sample, without removing anything.
    pub fn consume_latest(&self) -> Option<PowerSample> {
        *self.shared.latest.lock().unwrap()
    }

    /// Register a FIFO consumer with the default queue depth. It sees every
    /// sample published after this call.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let queue = Arc::new(Queue {
            samples: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 4096))),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        });
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .push(Arc::downgrade(&queue));
        Subscription {
            queue,
            bus: Arc::clone(&self.shared),
        }
    }

    /// Stop accepting samples and wake every waiting consumer.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        let subs = self.shared.subscribers.lock().unwrap();
        for queue in subs.iter().filter_map(Weak::upgrade) {
            queue.ready.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Total samples published so far.
    pub fn published(&self) -> u64 {
        self.shared.published.load(Ordering::Relaxed)
    }
}

/// A FIFO view of the bus owned by exactly one consumer.
pub struct Subscription {
    queue: Arc<Queue>,
    bus: Arc<Shared>,
}

impl Subscription {
    /// Remove and return every queued sample, oldest first.
    pub fn drain_all(&self) -> Vec<PowerSample> {
        self.queue.samples.lock().unwrap().drain(..).collect()
    }

    /// Wait up to `timeout` for at least one sample, then drain. Returns an
    /// empty vector on timeout or when the bus is closed and empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Vec<PowerSample> {
        let deadline = Instant::now() + timeout;
        let mut q = self.queue.samples.lock().unwrap();
        while q.is_empty() && !self.bus.closed.load(Ordering::SeqCst) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self.queue.ready.wait_timeout(q, remaining).unwrap();
            q = guard;
        }
        q.drain(..).collect()
    }

    /// Samples discarded because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.samples.lock().unwrap().len()
    }

    /// True once the bus is closed and this queue is empty.
    pub fn is_finished(&self) -> bool {
        self.bus.closed.load(Ordering::SeqCst) && self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Rail;
    use std::thread;

    fn s(ts: f64) -> PowerSample {
        PowerSample::at(ts).with(Rail::Ane, ts)
    }

    #[test]
    fn drain_all_is_fifo() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(s(i as f64));
        }
        let got: Vec<f64> = sub.drain_all().iter().map(|x| x.timestamp).collect();
        assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(sub.drain_all().is_empty());
    }

    #[test]
    fn latest_does_not_consume() {
        let bus = SampleBus::new();
        assert!(bus.consume_latest().is_none());
        bus.publish(s(1.0));
        bus.publish(s(2.0));
        assert_eq!(bus.consume_latest().unwrap().timestamp, 2.0);
        assert_eq!(bus.consume_latest().unwrap().timestamp, 2.0);
    }

    #[test]
    fn full_queue_drops_oldest() {
        let bus = SampleBus::new();
        let sub = bus.subscribe_with_capacity(3);
        for i in 0..5 {
            bus.publish(s(i as f64));
        }
        let got: Vec<f64> = sub.drain_all().iter().map(|x| x.timestamp).collect();
        assert_eq!(got, vec![2.0, 3.0, 4.0]);
        assert_eq!(sub.dropped(), 2);
    }

    #[test]
    fn independent_subscriptions_each_see_everything() {
        let bus = SampleBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(s(1.0));
        assert_eq!(a.drain_all().len(), 1);
        assert_eq!(b.drain_all().len(), 1);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = SampleBus::new();
        {
            let _sub = bus.subscribe();
        }
        bus.publish(s(1.0));
        assert!(bus.shared.subscribers.lock().unwrap().is_empty());
    }

    #[test]
    fn recv_timeout_returns_empty_on_timeout() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        let start = Instant::now();
        assert!(sub.recv_timeout(Duration::from_millis(30)).is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn recv_timeout_wakes_on_publish() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        let producer = bus.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.publish(s(7.0));
        });
        let got = sub.recv_timeout(Duration::from_secs(2));
        h.join().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].timestamp, 7.0);
    }

    #[test]
    fn close_rejects_publish_and_wakes() {
        let bus = SampleBus::new();
        let sub = bus.subscribe();
        bus.publish(s(1.0));
        bus.close();
        assert!(!bus.publish(s(2.0)));
        assert_eq!(sub.recv_timeout(Duration::from_secs(5)).len(), 1);
        assert!(sub.is_finished());
        assert_eq!(bus.published(), 1);
    }

    #[test]
    fn concurrent_producer_preserves_order() {
        let bus = SampleBus::new();
        let sub = bus.subscribe_with_capacity(10_000);
        let producer = bus.clone();
        let h = thread::spawn(move || {
            for i in 0..2000 {
                producer.publish(s(i as f64));
            }
            producer.close();
        });
        let mut got = Vec::new();
        while !sub.is_finished() {
            got.extend(sub.recv_timeout(Duration::from_millis(50)));
        }
        h.join().unwrap();
        assert_eq!(got.len(), 2000);
        assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }
}
