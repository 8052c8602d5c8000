//! Bounded message queue
//!
//! Holds messages for a bee whose cells are still being assigned.
//!
//! TigerStyle: Bounded queues with explicit limits, no silent drops.

use beehive_core::{Error, Msg};
use std::collections::VecDeque;

/// Bounded FIFO of messages
#[derive(Debug)]
pub struct Mailbox {
    owner: String,
    queue: VecDeque<Msg>,
    capacity: usize,
    enqueued_count: u64,
}

impl Mailbox {
    /// Mailbox for `owner` holding at most `capacity` messages
    pub fn with_capacity(owner: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");

        Self {
            owner: owner.into(),
            queue: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            enqueued_count: 0,
        }
    }

    /// Enqueue a message
    ///
    /// # Errors
    /// `MailboxFull` with the rejected message when at capacity.
    pub fn push(&mut self, msg: Msg) -> Result<(), (Msg, Error)> {
        if self.queue.len() >= self.capacity {
            let err = Error::MailboxFull {
                id: self.owner.clone(),
                depth: self.queue.len(),
                max: self.capacity,
            };
            return Err((msg, err));
        }

        self.queue.push_back(msg);
        self.enqueued_count = self.enqueued_count.wrapping_add(1);

        debug_assert!(self.queue.len() <= self.capacity);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Msg> {
        self.queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total messages ever enqueued
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued_count
    }

    /// Take every queued message in arrival order
    pub fn drain(&mut self) -> Vec<Msg> {
        self.queue.drain(..).collect()
    }
}
