//! Bounded per-connection outbound queue
//!
//! A slow client only fills its own queue. When full, the oldest message is
//! dropped so the client always converges on the freshest state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Frame handed to the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized envelope, shared by every recipient of a broadcast
    Text(Arc<str>),
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message
    DroppedOldest,
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Arc<str>>,
    ping_pending: bool,
    closed: bool,
}

#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, message: Arc<str>) -> PushOutcome {
        let outcome = {
            let mut state = self.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.items.len() >= self.capacity {
                state.items.pop_front();
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.items.push_back(message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Ask the writer for a ping frame; repeated requests collapse into one
    pub fn request_ping(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.ping_pending = true;
        }
        self.notify.notify_one();
    }

    /// Next frame without waiting; pings go first
    pub fn try_pop(&self) -> Option<Outbound> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        if std::mem::take(&mut state.ping_pending) {
            return Some(Outbound::Ping);
        }
        state.items.pop_front().map(Outbound::Text)
    }

    /// Next frame; `None` once the queue is closed
    pub async fn recv(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.try_pop() {
                return Some(frame);
            }
            notified.await;
        }
    }

    /// Stop accepting messages and wake the writer; pending items are discarded
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
