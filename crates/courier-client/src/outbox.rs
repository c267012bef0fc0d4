use std::collections::VecDeque;

use courier_shared::protocol::SendMessagePayload;

/// A send made while disconnected, waiting for the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSend {
    pub local_id: String,
    pub payload: SendMessagePayload,
}

/// FIFO of sends queued while offline, drained in original order.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<PendingSend>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pending: PendingSend) {
        if self.queue.iter().any(|p| p.local_id == pending.local_id) {
            return;
        }
        self.queue.push_back(pending);
    }

    /// Put back sends that could not go out, ahead of anything queued
    /// since, keeping their order.
    pub fn requeue_front(&mut self, pending: Vec<PendingSend>) {
        for p in pending.into_iter().rev() {
            self.queue.push_front(p);
        }
    }

    pub fn drain(&mut self) -> Vec<PendingSend> {
        self.queue.drain(..).collect()
    }

    pub fn remove(&mut self, local_id: &str) -> Option<PendingSend> {
        let index = self.queue.iter().position(|p| p.local_id == local_id)?;
        self.queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
