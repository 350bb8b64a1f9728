//! Bounded drop-oldest ingress queue
//!
//! Decouples OPC UA notification handlers (many concurrent publishers) from
//! the persistence coordinator (single consumer). `publish` never blocks and
//! never rejects a sample while the queue is open: at capacity, the oldest
//! resident sample is evicted to make room for the new arrival. Eviction
//! happens inside the queue's own critical section, so the dropped counter
//! is exact and increments by one per evicted sample.
//!
//! Publishers must not run storage work inline; the only synchronization on
//! the publish path is one short mutex acquisition and a waiter wakeup.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::sample::Sample;

/// Non-blocking counters exposed for the status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub closed: bool,
}

#[derive(Debug)]
struct QueueInner {
    buf: VecDeque<Sample>,
    closed: bool,
}

/// Fixed-capacity multi-producer / single-consumer sample queue.
#[derive(Debug)]
pub struct SampleQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    depth: AtomicUsize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be at least 1");
        Self {
            inner: Mutex::new(QueueInner {
                buf: VecDeque::with_capacity(capacity.min(4_096)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            depth: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a sample without blocking.
    ///
    /// Returns `false` only when the queue has been closed; the sample is
    /// then discarded silently. At capacity the oldest resident sample is
    /// evicted, never the new arrival.
    pub fn publish(&self, sample: Sample) -> bool {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return false;
            }
            if inner.buf.len() >= self.capacity {
                inner.buf.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            inner.buf.push_back(sample);
            self.depth.store(inner.buf.len(), Ordering::Release);
            self.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        true
    }

    /// Pop the oldest sample, if any. Single-consumer.
    pub fn try_pop(&self) -> Option<Sample> {
        let mut inner = self.inner.lock().unwrap();
        let sample = inner.buf.pop_front();
        self.depth.store(inner.buf.len(), Ordering::Release);
        sample
    }

    /// Wait until the queue is non-empty, the timeout elapses, or the queue
    /// closes. Returns `true` iff at least one sample is available.
    pub async fn wait_non_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.depth.load(Ordering::Acquire) > 0 {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return self.depth.load(Ordering::Acquire) > 0;
                }
            }
        }
    }

    /// Close the queue: wake all waiters and make subsequent publishes fail.
    /// Residual samples remain poppable for the shutdown drain.
    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            capacity: self.capacity,
            total_enqueued: self.total_enqueued(),
            total_dropped: self.total_dropped(),
            closed: self.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{make_sample, Value};
    use std::sync::Arc;

    fn sample(n: i32) -> Sample {
        make_sample("srv-a", &format!("ns=2;s=Node{}", n), Value::Int32(n))
    }

    #[test]
    fn test_publish_and_pop_fifo() {
        let queue = SampleQueue::new(8);
        for n in 0..3 {
            assert!(queue.publish(sample(n)));
        }
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(0));
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(1));
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(2));
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = SampleQueue::new(3);
        for n in 0..5 {
            assert!(queue.publish(sample(n)));
        }

        // Size stays at capacity, oldest two were evicted
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.total_enqueued(), 5);
        assert_eq!(queue.total_dropped(), 2);

        // Surviving tail keeps notification order
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(2));
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(3));
        assert_eq!(queue.try_pop().unwrap().value, Value::Int32(4));
    }

    #[test]
    fn test_depth_never_exceeds_capacity() {
        let queue = SampleQueue::new(4);
        for n in 0..100 {
            queue.publish(sample(n));
            assert!(queue.depth() <= 4);
        }
        assert_eq!(queue.total_dropped(), 96);
    }

    #[test]
    fn test_publish_after_close_fails_silently() {
        let queue = SampleQueue::new(4);
        assert!(queue.publish(sample(1)));
        queue.close();
        assert!(!queue.publish(sample(2)));
        assert_eq!(queue.total_enqueued(), 1);

        // Residual samples are still drainable
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_non_empty() {
        let queue = SampleQueue::new(4);
        queue.publish(sample(1));
        assert!(queue.wait_non_empty(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_empty() {
        let queue = SampleQueue::new(4);
        let start = std::time::Instant::now();
        assert!(!queue.wait_non_empty(Duration::from_millis(20)).await);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_publish() {
        let queue = Arc::new(SampleQueue::new(4));
        let waiter = Arc::clone(&queue);
        let handle =
            tokio::spawn(async move { waiter.wait_non_empty(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.publish(sample(1));
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let queue = Arc::new(SampleQueue::new(4));
        let waiter = Arc::clone(&queue);
        let handle =
            tokio::spawn(async move { waiter.wait_non_empty(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        assert!(!handle.await.unwrap());
    }

    #[test]
    fn test_concurrent_publishers() {
        let queue = Arc::new(SampleQueue::new(64));
        let num_threads = 8;
        let per_thread = 1_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let q = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for n in 0..per_thread {
                        q.publish(sample(t * per_thread + n));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.total_enqueued, (num_threads * per_thread) as u64);
        assert_eq!(stats.depth, 64);
        // Every enqueue beyond capacity evicted exactly one sample
        assert_eq!(stats.total_dropped, stats.total_enqueued - 64);
    }

    #[test]
    fn test_per_node_order_survives_eviction() {
        let queue = SampleQueue::new(3);
        for n in 0..6 {
            queue.publish(sample(n));
        }
        // Whatever survives must be in ascending emit order
        let mut last = -1;
        while let Some(s) = queue.try_pop() {
            let Value::Int32(n) = s.value else { panic!("unexpected variant") };
            assert!(n > last);
            last = n;
        }
    }
}
