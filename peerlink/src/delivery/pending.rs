//! Per-peer FIFO of messages waiting for an open data channel.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use peerlink_proto::message::{Message, PeerId};

/// Outbound messages held until a channel to their peer opens.
///
/// Messages are kept in plaintext form and sealed when flushed, so a key
/// change between queueing and sending is honoured.
#[derive(Debug, Default)]
pub struct PendingQueue {
    queues: Mutex<HashMap<PeerId, VecDeque<Message>>>,
}

impl PendingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to `peer`'s queue.
    pub fn push(&self, peer: &PeerId, message: Message) {
        self.queues
            .lock()
            .entry(peer.clone())
            .or_default()
            .push_back(message);
    }

    /// Remove and return everything queued for `peer`, oldest first.
    pub fn take(&self, peer: &PeerId) -> Vec<Message> {
        self.queues
            .lock()
            .remove(peer)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Put `messages` back at the front of `peer`'s queue, keeping their
    /// order ahead of anything queued in the meantime.
    pub fn restore_front(&self, peer: &PeerId, messages: Vec<Message>) {
        if messages.is_empty() {
            return;
        }
        let mut queues = self.queues.lock();
        let queue = queues.entry(peer.clone()).or_default();
        for message in messages.into_iter().rev() {
            queue.push_front(message);
        }
    }

    /// Number of messages queued for `peer`.
    #[must_use]
    pub fn len(&self, peer: &PeerId) -> usize {
        self.queues.lock().get(peer).map_or(0, VecDeque::len)
    }

    /// Whether nothing is queued for `peer`.
    #[must_use]
    pub fn is_empty(&self, peer: &PeerId) -> bool {
        self.len(peer) == 0
    }

    /// Peers that have at least one queued message.
    #[must_use]
    pub fn peers(&self) -> Vec<PeerId> {
        self.queues
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(peer, _)| peer.clone())
            .collect()
    }
}
