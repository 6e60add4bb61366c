//! Bounded attempt queue between the Intercept Engine's hot path and
//! Store's writer connection. Overflow drops the *oldest* pending entry,
//! not the newest. Decision latency must never wait on the audit log,
//! so this never blocks a producer.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::queries::NewAttempt;
use super::Store;

pub struct AttemptQueue {
    buffer: Mutex<VecDeque<NewAttempt>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl AttemptQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(AttemptQueue {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Never blocks. Drops the oldest buffered attempt if at capacity.
    pub fn push(&self, attempt: NewAttempt) {
        let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        if buf.len() >= self.capacity {
            buf.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        buf.push_back(attempt);
        drop(buf);
        self.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn pop(&self) -> Option<NewAttempt> {
        loop {
            {
                let mut buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(a) = buf.pop_front() {
                    return Some(a);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Spawns the background task that drains `queue` into `store`. Runs as
/// a tokio task since the write itself is dispatched through
/// `spawn_blocking`.
pub fn spawn_drain(store: Arc<Store>, queue: Arc<AttemptQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(attempt) = queue.pop().await {
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || store.append_attempt(attempt)).await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "attempt drain task panicked");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, Decision, Reason};

    fn attempt(session_id: i64) -> NewAttempt {
        NewAttempt {
            session_id,
            incoming_channel_id: ChannelId(1),
            outgoing_channel_id: ChannelId(2),
            amount_msat: 1,
            incoming_htlc_index: 0,
            outgoing_htlc_index: 0,
            decision: Decision::Fail,
            reason: Reason::NoException,
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let q = AttemptQueue::new(2);
        q.push(attempt(1));
        q.push(attempt(2));
        q.push(attempt(3));
        assert_eq!(q.dropped_count(), 1);
        let first = q.pop().await.unwrap();
        assert_eq!(first.session_id, 2);
        let second = q.pop().await.unwrap();
        assert_eq!(second.session_id, 3);
    }

    #[tokio::test]
    async fn close_unblocks_pop() {
        let q = AttemptQueue::new(4);
        q.close();
        assert!(q.pop().await.is_none());
    }
}
