//! External persistence for offline delivery, presence and groups.
//!
//! The delivery core only ever hands sealed envelopes to the store, so a
//! store never sees plaintext. Implementations include:
//! - [`memory::InMemoryStore`]: in-memory store for tests and the demo binary

pub mod memory;

use std::fmt;

use peerlink_proto::codec::SealedEnvelope;
use peerlink_proto::message::{
    GroupId, MessageId, MessageKind, PeerId, Recipient, Timestamp, UserId,
};
use peerlink_proto::presence::PresenceStatus;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Store-assigned identifier of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId(String);

impl RecordId {
    /// Wraps a store-assigned id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A sealed message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Id of the message inside the envelope.
    pub message_id: MessageId,
    /// Sending peer.
    pub sender_id: PeerId,
    /// Addressee.
    pub recipient: Recipient,
    /// Ciphertext and IV.
    pub envelope: SealedEnvelope,
    /// Kind of the sealed message.
    pub kind: MessageKind,
    /// Message replied to, if any.
    pub parent_message_id: Option<MessageId>,
    /// Creation time of the message.
    pub timestamp: Timestamp,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// Record id.
    pub id: RecordId,
    /// What was persisted.
    pub message: NewMessage,
    /// Whether the recipient has picked it up.
    pub delivered: bool,
}

/// State of an offline queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineStatus {
    /// Waiting for the recipient.
    Queued,
    /// Picked up by the recipient.
    Delivered,
}

/// One message waiting in a recipient's offline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineEntry {
    /// Queue entry id.
    pub id: RecordId,
    /// Recipient key the entry was queued under.
    pub recipient_id: String,
    /// Entry state.
    pub status: OfflineStatus,
    /// The queued message.
    pub message: StoredMessage,
}

/// A persisted group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    /// Group id.
    pub id: GroupId,
    /// Display name.
    pub name: String,
    /// Creating peer.
    pub created_by: PeerId,
    /// Members, creator included.
    pub members: Vec<PeerId>,
}

/// Persistence used for offline delivery, presence and groups.
pub trait ExternalStore: Send + Sync + 'static {
    /// Persist a sealed message and return its record id.
    fn save_message(
        &self,
        message: NewMessage,
    ) -> impl std::future::Future<Output = Result<RecordId, StoreError>> + Send;

    /// Queue a saved message for `recipient_id`.
    fn add_to_offline_queue(
        &self,
        message: &RecordId,
        recipient_id: &str,
    ) -> impl std::future::Future<Output = Result<RecordId, StoreError>> + Send;

    /// Queued entries for `recipient_id`, oldest first.
    fn get_offline_messages(
        &self,
        recipient_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<OfflineEntry>, StoreError>> + Send;

    /// Mark a saved message as delivered.
    fn mark_message_delivered(
        &self,
        message: &RecordId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Remove an entry from its offline queue.
    fn remove_from_offline_queue(
        &self,
        entry: &RecordId,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Record a user's presence.
    fn update_connection_status(
        &self,
        user: &UserId,
        status: PresenceStatus,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Persist a new group and return its id.
    fn create_group(
        &self,
        name: &str,
        created_by: &PeerId,
        members: &[PeerId],
    ) -> impl std::future::Future<Output = Result<GroupId, StoreError>> + Send;

    /// Groups `peer` belongs to.
    fn get_user_groups(
        &self,
        peer: &PeerId,
    ) -> impl std::future::Future<Output = Result<Vec<GroupRecord>, StoreError>> + Send;
}
