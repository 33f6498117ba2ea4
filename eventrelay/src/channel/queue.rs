use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

use crate::events::Event;

/// Lock-free bounded outbound buffer with drop-oldest overflow.
///
/// Producers never block. The write loop waits on [`OutboundQueue::notified`] when the
/// queue is empty.
#[derive(Debug)]
pub struct OutboundQueue {
    items: ArrayQueue<Event>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
        }
    }

    /// Enqueue an event, evicting and returning the oldest one if the queue is full.
    pub fn push(&self, event: Event) -> Option<Event> {
        let evicted = self.items.force_push(event);
        self.notify.notify_one();
        evicted
    }

    /// Put back an event whose send failed. Dropped if newer events have filled the queue.
    pub fn requeue(&self, event: Event) -> bool {
        let accepted = self.items.push(event).is_ok();
        if accepted {
            self.notify.notify_one();
        }
        accepted
    }

    pub fn pop(&self) -> Option<Event> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Resolves after the next push. A push that happened while nobody was waiting
    /// is remembered, so checking `is_empty` then awaiting this does not miss wakeups.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
