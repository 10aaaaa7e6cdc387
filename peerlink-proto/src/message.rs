//! Message types exchanged between `PeerLink` peers.
//!
//! A [`Message`] is immutable once created: edits and deletions are new
//! messages whose body references the original [`MessageId`]. Messages are
//! serialized to JSON and sealed by the crypto layer before they touch a
//! data channel.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed size of a text body or file chunk in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Identifier of one running peer session.
///
/// Generated at startup and stable for the lifetime of that session. The
/// signaling relay routes by this value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random peer identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an authenticated user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this user ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a message, based on UUID v7 for time-ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a chat group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Uuid);

impl GroupId {
    /// Creates a new group identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `GroupId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Addressee of a message: one peer or every member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recipient {
    /// A single remote peer.
    Peer(PeerId),
    /// All members of a group roster.
    Group(GroupId),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(p) => write!(f, "peer:{p}"),
            Self::Group(g) => write!(f, "group:{g}"),
        }
    }
}

/// Discriminant of a [`MessageBody`], used for logging and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Plain text chat.
    Chat,
    /// File transfer announcement.
    FileMeta,
    /// One chunk of a file transfer.
    FileChunk,
    /// Typing indicator.
    TypingStatus,
    /// Emoji reaction to another message.
    Reaction,
    /// Deletion of an earlier message.
    DeleteMessage,
    /// Edit of an earlier message.
    EditMessage,
    /// Receipt confirming a message reached the peer.
    DeliveryReceipt,
    /// Receipt confirming a message was shown to the user.
    ReadReceipt,
    /// Announcement of a newly created group.
    GroupCreated,
    /// Local notification: a peer came online.
    PeerConnected,
    /// Local notification: a peer went offline.
    PeerDisconnected,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Chat => "CHAT",
            Self::FileMeta => "FILE_META",
            Self::FileChunk => "FILE_CHUNK",
            Self::TypingStatus => "TYPING_STATUS",
            Self::Reaction => "REACTION",
            Self::DeleteMessage => "DELETE_MESSAGE",
            Self::EditMessage => "EDIT_MESSAGE",
            Self::DeliveryReceipt => "DELIVERY_RECEIPT",
            Self::ReadReceipt => "READ_RECEIPT",
            Self::GroupCreated => "GROUP_CREATED",
            Self::PeerConnected => "PEER_CONNECTED",
            Self::PeerDisconnected => "PEER_DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Typed payload of a [`Message`].
///
/// Serialized with an inline `type` tag, e.g.
/// `{"type":"CHAT","text":"hi"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum MessageBody {
    /// Plain text.
    Chat {
        /// Message text.
        text: String,
    },
    /// Announces a file that will follow as chunks.
    FileMeta {
        /// Transfer identifier shared by all chunks.
        file_id: String,
        /// Original file name.
        name: String,
        /// Total size in bytes.
        size: u64,
        /// MIME type reported by the sender.
        mime_type: String,
        /// Number of chunks that will follow.
        chunk_count: u32,
    },
    /// One chunk of a file.
    FileChunk {
        /// Transfer identifier from the matching `FileMeta`.
        file_id: String,
        /// Zero-based chunk index.
        index: u32,
        /// Raw chunk bytes.
        data: Vec<u8>,
    },
    /// Typing indicator.
    TypingStatus {
        /// Whether the sender is currently typing.
        is_typing: bool,
    },
    /// Emoji reaction.
    Reaction {
        /// Message being reacted to.
        target: MessageId,
        /// The reaction emoji.
        emoji: String,
    },
    /// Deletes an earlier message.
    DeleteMessage {
        /// Message being deleted.
        target: MessageId,
    },
    /// Replaces the text of an earlier message.
    EditMessage {
        /// Message being edited.
        target: MessageId,
        /// Replacement text.
        text: String,
    },
    /// Confirms that a message reached the recipient.
    DeliveryReceipt {
        /// The message being acknowledged.
        message_id: MessageId,
    },
    /// Confirms that a message was presented to the recipient's user.
    ReadReceipt {
        /// The message being acknowledged.
        message_id: MessageId,
    },
    /// Announces a new group to its members.
    GroupCreated {
        /// The new group.
        group_id: GroupId,
        /// Display name of the group.
        name: String,
        /// Member peers, including the creator.
        members: Vec<PeerId>,
    },
    /// Local pseudo-message: `peer_id` came online. Never transmitted.
    PeerConnected {
        /// The peer that came online.
        peer_id: PeerId,
    },
    /// Local pseudo-message: `peer_id` went offline. Never transmitted.
    PeerDisconnected {
        /// The peer that went offline.
        peer_id: PeerId,
    },
}

impl MessageBody {
    /// Returns the discriminant of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Chat { .. } => MessageKind::Chat,
            Self::FileMeta { .. } => MessageKind::FileMeta,
            Self::FileChunk { .. } => MessageKind::FileChunk,
            Self::TypingStatus { .. } => MessageKind::TypingStatus,
            Self::Reaction { .. } => MessageKind::Reaction,
            Self::DeleteMessage { .. } => MessageKind::DeleteMessage,
            Self::EditMessage { .. } => MessageKind::EditMessage,
            Self::DeliveryReceipt { .. } => MessageKind::DeliveryReceipt,
            Self::ReadReceipt { .. } => MessageKind::ReadReceipt,
            Self::GroupCreated { .. } => MessageKind::GroupCreated,
            Self::PeerConnected { .. } => MessageKind::PeerConnected,
            Self::PeerDisconnected { .. } => MessageKind::PeerDisconnected,
        }
    }
}

/// A complete message with routing metadata, ready for sealing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Peer that created the message.
    pub sender_id: PeerId,
    /// Peer or group the message is addressed to.
    pub recipient: Recipient,
    /// When the message was created.
    pub timestamp: Timestamp,
    /// Message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<MessageId>,
    /// Typed payload.
    pub body: MessageBody,
}

/// Error returned when a message fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message text is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// The message kind only exists locally and cannot be transmitted.
    #[error("{0} messages are local notifications and cannot be sent")]
    LocalOnly(MessageKind),
}

impl Message {
    /// Creates a new message stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(sender_id: PeerId, recipient: Recipient, body: MessageBody) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            recipient,
            timestamp: Timestamp::now(),
            parent_message_id: None,
            body,
        }
    }

    /// Convenience constructor for a text message to one peer.
    #[must_use]
    pub fn chat(sender_id: PeerId, to: PeerId, text: impl Into<String>) -> Self {
        Self::new(
            sender_id,
            Recipient::Peer(to),
            MessageBody::Chat { text: text.into() },
        )
    }

    /// Sets the parent message this one replies to.
    #[must_use]
    pub fn with_parent(mut self, parent: MessageId) -> Self {
        self.parent_message_id = Some(parent);
        self
    }

    /// Returns the kind of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Returns `true` for delivery and read receipts.
    ///
    /// Receipts are best-effort: never queued, persisted or retried.
    #[must_use]
    pub const fn is_receipt(&self) -> bool {
        matches!(
            self.body,
            MessageBody::DeliveryReceipt { .. } | MessageBody::ReadReceipt { .. }
        )
    }

    /// Validates this message for sending.
    ///
    /// Text bodies must be non-empty and at most [`MAX_MESSAGE_SIZE`] bytes,
    /// file chunks must fit the same limit, and local pseudo-messages are
    /// rejected outright.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match &self.body {
            MessageBody::Chat { text } | MessageBody::EditMessage { text, .. } => {
                check_text(text)
            }
            MessageBody::FileChunk { data, .. } => check_size(data.len()),
            MessageBody::PeerConnected { .. } | MessageBody::PeerDisconnected { .. } => {
                Err(ValidationError::LocalOnly(self.kind()))
            }
            MessageBody::FileMeta { .. }
            | MessageBody::TypingStatus { .. }
            | MessageBody::Reaction { .. }
            | MessageBody::DeleteMessage { .. }
            | MessageBody::DeliveryReceipt { .. }
            | MessageBody::ReadReceipt { .. }
            | MessageBody::GroupCreated { .. } => Ok(()),
        }
    }
}

fn check_text(text: &str) -> Result<(), ValidationError> {
    if text.is_empty() {
        return Err(ValidationError::Empty);
    }
    check_size(text.len())
}

const fn check_size(size: usize) -> Result<(), ValidationError> {
    if size > MAX_MESSAGE_SIZE {
        return Err(ValidationError::TooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}
