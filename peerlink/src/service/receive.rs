//! Receive pipeline methods for [`PeerService`].
//!
//! Inbound frames are size-checked, parsed, opened and checked against the
//! channel's peer before they are acknowledged and dispatched. Messages
//! parked in the offline store take the same path once opened.

use peerlink_proto::codec;
use peerlink_proto::message::{Message, MessageBody, MessageKind, PeerId, Recipient};

use crate::notice::NoticeKind;
use crate::rtc::RtcBackend;
use crate::signal::SignalSender;
use crate::store::{ExternalStore, StoreError};

use super::PeerService;

impl<B: RtcBackend, S: SignalSender, St: ExternalStore> PeerService<B, S, St> {
    /// Process one text frame received on a data channel to `peer`.
    pub(super) async fn receive_frame(&self, peer: &PeerId, data: &str) {
        if data.len() > self.delivery_config.max_payload_size {
            tracing::warn!(
                peer = %peer,
                size = data.len(),
                max = self.delivery_config.max_payload_size,
                "dropping oversized payload"
            );
            self.notices.emit(
                NoticeKind::PayloadDropped,
                Some(peer),
                Some(format!("payload of {} bytes", data.len())),
            );
            return;
        }

        let envelope = match codec::decode_envelope(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping malformed envelope");
                self.notices
                    .emit(NoticeKind::PayloadDropped, Some(peer), Some(e.to_string()));
                return;
            }
        };

        let message = match self.crypto.open(peer, &envelope) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to decrypt payload");
                self.notices
                    .emit(NoticeKind::DecryptFailed, Some(peer), Some(e.to_string()));
                return;
            }
        };

        if &message.sender_id != peer {
            tracing::warn!(
                peer = %peer,
                claimed = %message.sender_id,
                "dropping message with spoofed sender"
            );
            self.notices.emit(
                NoticeKind::PayloadDropped,
                Some(peer),
                Some(format!("sender mismatch: {}", message.sender_id)),
            );
            return;
        }

        self.accept(message).await;
    }

    /// Acknowledge and dispatch an opened message.
    ///
    /// Every chat message gets a delivery receipt, duplicates included, so a
    /// sender whose first receipt was lost still hears back. Duplicates are
    /// not dispatched again.
    async fn accept(&self, message: Message) {
        if let Err(e) = message.validate() {
            tracing::warn!(peer = %message.sender_id, error = %e, "dropping invalid inbound message");
            self.notices.emit(
                NoticeKind::PayloadDropped,
                Some(&message.sender_id),
                Some(e.to_string()),
            );
            return;
        }

        if message.kind() == MessageKind::Chat {
            let receipt = Message::new(
                self.local_id.clone(),
                Recipient::Peer(message.sender_id.clone()),
                MessageBody::DeliveryReceipt {
                    message_id: message.id.clone(),
                },
            );
            self.send_to_peer(&message.sender_id, receipt).await;
        }

        if !self.seen.lock().insert(&message.id) {
            tracing::debug!(message_id = %message.id, "duplicate message, not dispatching");
            return;
        }

        if let MessageBody::GroupCreated {
            group_id,
            name,
            members,
        } = &message.body
        {
            tracing::info!(group = %group_id, name = %name, "joined group");
            self.roster.insert(group_id.clone(), members.iter().cloned());
        }

        tracing::trace!(
            peer = %message.sender_id,
            message_id = %message.id,
            kind = %message.kind(),
            "message received"
        );
        self.batcher.push(message);
    }

    /// Drain the local peer's offline queue.
    ///
    /// Each entry is opened with its sender's key and dispatched like a live
    /// message, then marked delivered and removed. Entries that cannot be
    /// opened are removed as well. Returns the number of messages
    /// dispatched.
    ///
    /// # Errors
    ///
    /// Returns the store error if the queue cannot be read. Failures on
    /// individual entries are logged and skipped.
    pub async fn sync_offline_messages(&self) -> Result<usize, StoreError> {
        let entries = self
            .store
            .get_offline_messages(self.local_id.as_str())
            .await?;
        let mut delivered = 0;

        for entry in entries {
            let stored = &entry.message;
            let sender = &stored.message.sender_id;
            match self.crypto.open(sender, &stored.message.envelope) {
                Ok(message) if &message.sender_id == sender => {
                    self.accept(message).await;
                    delivered += 1;
                    if let Err(e) = self.store.mark_message_delivered(&stored.id).await {
                        tracing::warn!(record = %stored.id, error = %e, "failed to mark delivered");
                    }
                }
                Ok(message) => {
                    tracing::warn!(
                        record = %stored.id,
                        claimed = %message.sender_id,
                        "offline entry sender mismatch, discarding"
                    );
                    self.notices.emit(
                        NoticeKind::PayloadDropped,
                        Some(sender),
                        Some(format!("sender mismatch: {}", message.sender_id)),
                    );
                }
                Err(e) => {
                    tracing::warn!(record = %stored.id, error = %e, "cannot open offline entry, discarding");
                    self.notices
                        .emit(NoticeKind::DecryptFailed, Some(sender), Some(e.to_string()));
                }
            }
            if let Err(e) = self.store.remove_from_offline_queue(&entry.id).await {
                tracing::warn!(entry = %entry.id, error = %e, "failed to remove offline entry");
            }
        }

        tracing::info!(delivered, "offline queue drained");
        Ok(delivered)
    }
}
