//! Per-user log fan-out
//!
//! Session workers and the circuit breaker push human-readable lines for a
//! user; every live subscriber of that user (one per open log stream) gets a
//! copy. Delivery is best effort: a slow or gone subscriber is skipped and
//! lines emitted while nobody listens are dropped.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::types::{LogLine, UserId};

/// Identifier of one subscriber
pub type SubscriberId = u64;

struct Inner {
    subscribers: RwLock<HashMap<UserId, Vec<(SubscriberId, mpsc::Sender<LogLine>)>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Inner {
    fn unregister(&self, user_id: UserId, id: SubscriberId) {
        let mut subs = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get_mut(&user_id) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                subs.remove(&user_id);
            }
        }
    }
}

/// Broadcaster shared by every session of the process
#[derive(Clone)]
pub struct LogBroadcaster {
    inner: Arc<Inner>,
}

impl LogBroadcaster {
    /// Create a broadcaster whose subscriber channels hold `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Add a subscriber for `user_id`. Dropping the subscription unregisters it.
    pub fn register(&self, user_id: UserId) -> LogSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id)
            .or_default()
            .push((id, tx));

        tracing::debug!(user_id, subscriber = id, "Log subscriber registered");

        LogSubscription {
            id,
            user_id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, user_id: UserId, id: SubscriberId) {
        self.inner.unregister(user_id, id);
    }

    /// Send `message` to every subscriber of `user_id`
    pub fn log(&self, user_id: UserId, message: impl Into<String>) {
        let line = LogLine {
            user_id,
            message: message.into(),
            timestamp: Utc::now(),
        };
        tracing::info!(user_id, "{}", line.message);

        let subs = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subs.get(&user_id) {
            for (_, tx) in list {
                // full or closed channels are skipped
                let _ = tx.try_send(line.clone());
            }
        }
    }

    /// Number of live subscribers for a user
    pub fn subscriber_count(&self, user_id: UserId) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiving end of a log stream
pub struct LogSubscription {
    id: SubscriberId,
    user_id: UserId,
    rx: mpsc::Receiver<LogLine>,
    inner: Arc<Inner>,
}

impl LogSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Wait for the next line
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }

    /// Next buffered line, if any
    pub fn try_recv(&mut self) -> Option<LogLine> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.inner.unregister(self.user_id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_reach_only_the_owning_user() {
        let logs = LogBroadcaster::new(8);
        let mut alice = logs.register(1);
        let mut bob = logs.register(2);

        logs.log(1, "INFO: hello");

        assert_eq!(alice.recv().await.unwrap().message, "INFO: hello");
        assert!(bob.try_recv().is_none());
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let logs = LogBroadcaster::new(8);
        let mut a = logs.register(1);
        let mut b = logs.register(1);
        assert_ne!(a.id(), b.id());

        logs.log(1, "ACTION: BUY");
        assert_eq!(a.try_recv().unwrap().message, "ACTION: BUY");
        assert_eq!(b.try_recv().unwrap().message, "ACTION: BUY");
    }

    #[test]
    fn full_channels_drop_lines_without_blocking() {
        let logs = LogBroadcaster::new(2);
        let mut sub = logs.register(1);
        for i in 0..5 {
            logs.log(1, format!("line {}", i));
        }
        assert_eq!(sub.try_recv().unwrap().message, "line 0");
        assert_eq!(sub.try_recv().unwrap().message, "line 1");
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn no_history_for_late_subscribers() {
        let logs = LogBroadcaster::new(4);
        logs.log(1, "before");
        let mut sub = logs.register(1);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn dropping_a_subscription_unregisters_it() {
        let logs = LogBroadcaster::new(4);
        let a = logs.register(1);
        let b = logs.register(1);
        assert_eq!(logs.subscriber_count(1), 2);

        drop(a);
        assert_eq!(logs.subscriber_count(1), 1);

        logs.unregister(1, b.id());
        assert_eq!(logs.subscriber_count(1), 0);
        // the later drop of `b` is a no-op
        drop(b);
        logs.unregister(9, 42);
    }
}
