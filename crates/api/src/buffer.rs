//! Event stream buffer: bounded FIFO between operation tasks and the delivery loop.
//!
//! Producers never block. When full, the oldest event is dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use meshd_core::Event;
use meshd_ops::EventSink;
use metrics::counter;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_CAPACITY: usize = 100;

pub struct EventBuffer {
    queue: Mutex<VecDeque<Event>>,
    cap: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl EventBuffer {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self { queue: Mutex::new(VecDeque::with_capacity(cap)), cap, dropped: AtomicU64::new(0), notify: Notify::new() }
    }

    pub fn capacity(&self) -> usize { self.cap }

    pub fn len(&self) -> usize { self.queue.lock().map(|q| q.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Events discarded because the buffer was full.
    pub fn dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }

    pub fn push(&self, ev: Event) {
        let Ok(mut q) = self.queue.lock() else { return };
        if q.len() >= self.cap {
            if let Some(old) = q.pop_front() {
                self.note_drop(&old);
            }
        }
        q.push_back(ev);
        drop(q);
        counter!("events_enqueued_total", 1u64);
        self.notify.notify_one();
    }

    /// Put an undelivered event back at the head so it goes out next.
    /// When full, the newest event makes room.
    pub fn requeue_front(&self, ev: Event) {
        let Ok(mut q) = self.queue.lock() else { return };
        if q.len() >= self.cap {
            if let Some(newest) = q.pop_back() {
                self.note_drop(&newest);
            }
        }
        q.push_front(ev);
        drop(q);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Event> { self.queue.lock().ok().and_then(|mut q| q.pop_front()) }

    /// Wait for the next event; `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<Event> {
        loop {
            if let Some(ev) = self.pop() {
                return Some(ev);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    fn note_drop(&self, ev: &Event) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        counter!("events_dropped_total", 1u64);
        warn!(op_id = %ev.operation_id, summary = %ev.summary, cap = self.cap, "event buffer full; dropping event");
    }
}

impl Default for EventBuffer {
    fn default() -> Self { Self::with_capacity(DEFAULT_CAPACITY) }
}

impl EventSink for EventBuffer {
    fn publish(&self, event: Event) { self.push(event); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn ev(id: &str) -> Event { Event::info(id, "s", "d") }

    fn ids(b: &EventBuffer) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(e) = b.pop() {
            out.push(e.operation_id);
        }
        out
    }

    #[test]
    fn overflow_drops_oldest() {
        let b = EventBuffer::with_capacity(3);
        for i in 1..=5 {
            b.push(ev(&i.to_string()));
        }
        assert_eq!(b.dropped(), 2);
        assert_eq!(ids(&b), vec!["3", "4", "5"]);
    }

    #[test]
    fn requeued_event_goes_out_first() {
        let b = EventBuffer::with_capacity(3);
        b.push(ev("b"));
        b.push(ev("c"));
        b.requeue_front(ev("a"));
        assert_eq!(ids(&b), vec!["a", "b", "c"]);

        b.push(ev("b"));
        b.push(ev("c"));
        b.push(ev("d"));
        b.requeue_front(ev("a"));
        assert_eq!(b.dropped(), 1);
        assert_eq!(ids(&b), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn next_wakes_on_push() {
        let b = Arc::new(EventBuffer::default());
        let cancel = CancellationToken::new();
        let waiter = {
            let b = b.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { b.next(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.publish(ev("x"));
        let got = tokio::time::timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert_eq!(got.map(|e| e.operation_id).as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn next_returns_none_on_cancel() {
        let b = EventBuffer::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(b.next(&cancel).await.is_none());
    }
}
