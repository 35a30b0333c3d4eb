//! Control messages waiting for the socket to open.

use std::collections::VecDeque;

use crate::error::{RelayError, RelayResult};
use crate::protocol::ClientMessage;

/// Bounded FIFO of control messages sent before the connection is ready.
///
/// Messages leave in the order they were pushed. When the buffer is full the new
/// message is refused, never an older one.
#[derive(Debug)]
pub struct OutboundBuffer {
    capacity: usize,
    queue: VecDeque<ClientMessage>,
}

impl OutboundBuffer {
    /// A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queue: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, message: ClientMessage) -> RelayResult<()> {
        if self.queue.len() >= self.capacity {
            return Err(RelayError::Backpressure {
                capacity: self.capacity,
            });
        }
        self.queue.push_back(message);
        Ok(())
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<ClientMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
