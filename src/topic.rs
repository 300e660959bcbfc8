//! Topic-style fan-out channels.
//!
//! A [`Topic`] delivers every published value to every live
//! [`Subscription`], each with its own queue. Ticker topics use a
//! depth-one queue with drop-oldest semantics (a slow Limiter only ever
//! sees the latest price) and deliver the most recent value immediately
//! on subscribe; order-update topics use unbounded queues because every
//! message matters.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// A multi-subscriber broadcast topic.
#[derive(Debug)]
pub struct Topic<T: Clone> {
    inner: Arc<Mutex<TopicInner<T>>>,
}

#[derive(Debug)]
struct TopicInner<T> {
    last: Option<T>,
    subscribers: Vec<Arc<SubShared<T>>>,
    closed: bool,
}

#[derive(Debug)]
struct SubShared<T> {
    queue: Mutex<VecDeque<T>>,
    // None means unbounded.
    limit: Option<usize>,
    notify: Notify,
    closed: AtomicBool,
    detached: AtomicBool,
}

/// One subscriber's end of a [`Topic`].
#[derive(Debug)]
pub struct Subscription<T> {
    shared: Arc<SubShared<T>>,
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Topic<T> {
    /// A topic with no subscribers and no published value.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TopicInner {
                last: None,
                subscribers: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Subscribe with a bounded queue of `limit` entries; when the queue
    /// is full the oldest entry is dropped. With `include_recent`, the
    /// most recently published value (if any) is delivered immediately.
    #[must_use]
    pub fn subscribe(&self, limit: usize, include_recent: bool) -> Subscription<T> {
        self.subscribe_inner(Some(limit.max(1)), include_recent)
    }

    /// Subscribe with an unbounded queue.
    #[must_use]
    pub fn subscribe_unbounded(&self) -> Subscription<T> {
        self.subscribe_inner(None, false)
    }

    fn subscribe_inner(&self, limit: Option<usize>, include_recent: bool) -> Subscription<T> {
        let mut inner = self.inner.lock().expect("topic lock poisoned");

        let mut queue = VecDeque::new();
        if include_recent {
            if let Some(ref last) = inner.last {
                queue.push_back(last.clone());
            }
        }

        let shared = Arc::new(SubShared {
            queue: Mutex::new(queue),
            limit,
            notify: Notify::new(),
            closed: AtomicBool::new(inner.closed),
            detached: AtomicBool::new(false),
        });
        inner.subscribers.push(Arc::clone(&shared));

        Subscription { shared }
    }

    /// Publish a value to every live subscriber.
    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        inner.last = Some(value.clone());
        inner
            .subscribers
            .retain(|sub| !sub.detached.load(Ordering::Acquire));

        for sub in &inner.subscribers {
            let mut queue = sub.queue.lock().expect("subscriber queue lock poisoned");
            if let Some(limit) = sub.limit {
                while queue.len() >= limit {
                    queue.pop_front();
                }
            }
            queue.push_back(value.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// The most recently published value.
    #[must_use]
    pub fn recent(&self) -> Option<T> {
        self.inner.lock().expect("topic lock poisoned").last.clone()
    }

    /// Close the topic; pending queue contents drain, then subscribers
    /// observe end-of-stream.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        inner.closed = true;
        for sub in &inner.subscribers {
            sub.closed.store(true, Ordering::Release);
            sub.notify.notify_one();
        }
    }
}

impl<T: Clone> Drop for Topic<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> Subscription<T> {
    /// Receive the next value, or `None` once the topic is closed and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut queue = self
                    .shared
                    .queue
                    .lock()
                    .expect("subscriber queue lock poisoned");
                if let Some(value) = queue.pop_front() {
                    return Some(value);
                }
            }

            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            self.shared.notify.notified().await;
        }
    }

    /// Take the next value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.shared
            .queue
            .lock()
            .expect("subscriber queue lock poisoned")
            .pop_front()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.shared.detached.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order() {
        let topic = Topic::new();
        let mut sub = topic.subscribe_unbounded();

        topic.publish(1);
        topic.publish(2);
        topic.publish(3);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(3));
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest() {
        let topic = Topic::new();
        let mut sub = topic.subscribe(1, false);

        topic.publish(1);
        topic.publish(2);
        topic.publish(3);

        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn include_recent_primes_new_subscribers() {
        let topic = Topic::new();
        topic.publish(41);
        topic.publish(42);

        let mut sub = topic.subscribe(1, true);
        assert_eq!(sub.recv().await, Some(42));
    }

    #[tokio::test]
    async fn close_ends_the_stream_after_drain() {
        let topic = Topic::new();
        let mut sub = topic.subscribe_unbounded();

        topic.publish(7);
        topic.close();

        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);
    }
}
