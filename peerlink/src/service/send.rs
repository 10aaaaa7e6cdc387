//! Send pipeline methods for [`PeerService`].
//!
//! Routing of one outbound message: group fan-out, offline store, pending
//! queue or a direct write to an open data channel.

use peerlink_proto::codec;
use peerlink_proto::message::{Message, MessageBody, MessageId, PeerId, Recipient};

use crate::delivery::{DeliveryError, SendOutcome};
use crate::notice::NoticeKind;
use crate::rtc::RtcBackend;
use crate::signal::SignalSender;
use crate::store::{ExternalStore, NewMessage};

use super::PeerService;

impl<B: RtcBackend, S: SignalSender, St: ExternalStore> PeerService<B, S, St> {
    /// Send `message` to its recipient.
    ///
    /// Invalid messages fail without side effects. Group messages fan out
    /// to every member; the outcome is the best per-member outcome.
    pub async fn send_message(&self, message: Message) -> SendOutcome {
        if let Err(e) = message.validate() {
            tracing::warn!(message_id = %message.id, error = %e, "rejecting invalid message");
            return SendOutcome::Failed;
        }
        match message.recipient.clone() {
            Recipient::Group(_) => self.fan_out(message).await,
            Recipient::Peer(peer) => self.send_to_peer(&peer, message).await,
        }
    }

    /// Tell `to` that `message_id` was shown to the local user.
    ///
    /// Receipts are never queued: without an open channel this fails.
    pub async fn send_read_receipt(&self, message_id: MessageId, to: &PeerId) -> SendOutcome {
        let receipt = Message::new(
            self.local_id.clone(),
            Recipient::Peer(to.clone()),
            MessageBody::ReadReceipt { message_id },
        );
        self.send_to_peer(to, receipt).await
    }

    /// Route one message addressed to a single peer.
    pub(super) async fn send_to_peer(&self, peer: &PeerId, message: Message) -> SendOutcome {
        if message.is_receipt() {
            return match self.transmit(peer, &message).await {
                Ok(()) => SendOutcome::Sent,
                Err(e) => {
                    tracing::debug!(peer = %peer, kind = %message.kind(), error = %e, "receipt dropped");
                    SendOutcome::Failed
                }
            };
        }

        if self.presence.is_offline(peer) {
            return self.queue_offline(peer, message).await;
        }

        if !self.manager.has_open_channel(peer).await {
            tracing::debug!(peer = %peer, message_id = %message.id, "no open channel, queueing");
            self.pending.push(peer, message);
            if self.manager.has_open_channel(peer).await {
                // The channel opened while we were queueing.
                self.flush_pending(peer).await;
            } else if !self.manager.has_connection(peer).await {
                let _ = self.manager.initiate(peer, false).await;
            }
            return SendOutcome::Queued;
        }

        match self.transmit(peer, &message).await {
            Ok(()) => {
                tracing::debug!(peer = %peer, message_id = %message.id, "message sent");
                SendOutcome::Sent
            }
            Err(DeliveryError::Peer(e)) => {
                tracing::warn!(peer = %peer, error = %e, "transmit failed, requeueing");
                self.pending.push(peer, message);
                SendOutcome::Queued
            }
            Err(e) => {
                tracing::warn!(peer = %peer, message_id = %message.id, error = %e, "send failed");
                SendOutcome::Failed
            }
        }
    }

    /// Seal `message` for `peer` and write it to the first open channel.
    async fn transmit(&self, peer: &PeerId, message: &Message) -> Result<(), DeliveryError> {
        let envelope = self.crypto.seal(peer, message)?;
        let frame = codec::encode_envelope(&envelope)?;
        self.manager.send_on_channel(peer, frame).await?;
        Ok(())
    }

    /// Hand everything queued for `peer` to its channel, oldest first.
    ///
    /// Stops at the first failure and puts the remainder back in front.
    pub(super) async fn flush_pending(&self, peer: &PeerId) {
        let mut queued = self.pending.take(peer).into_iter();
        let mut sent = 0usize;
        while let Some(message) = queued.next() {
            if let Err(e) = self.transmit(peer, &message).await {
                tracing::warn!(peer = %peer, error = %e, "pending flush interrupted");
                let rest: Vec<Message> = std::iter::once(message).chain(queued).collect();
                self.pending.restore_front(peer, rest);
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            tracing::debug!(peer = %peer, sent, "flushed pending messages");
        }
    }

    /// Persist a sealed copy for an offline peer, falling back to the
    /// pending queue when the store fails.
    async fn queue_offline(&self, peer: &PeerId, message: Message) -> SendOutcome {
        match self.store_offline(peer, &message).await {
            Ok(()) => {
                tracing::debug!(peer = %peer, message_id = %message.id, "queued in offline store");
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "offline store failed, keeping message pending");
                self.notices
                    .emit(NoticeKind::StoreFallback, Some(peer), Some(e.to_string()));
                self.pending.push(peer, message);
            }
        }
        SendOutcome::Queued
    }

    async fn store_offline(&self, peer: &PeerId, message: &Message) -> Result<(), DeliveryError> {
        let envelope = self.crypto.seal(peer, message)?;
        let record = self
            .store
            .save_message(NewMessage {
                message_id: message.id.clone(),
                sender_id: message.sender_id.clone(),
                recipient: message.recipient.clone(),
                envelope,
                kind: message.kind(),
                parent_message_id: message.parent_message_id.clone(),
                timestamp: message.timestamp,
            })
            .await?;
        self.store
            .add_to_offline_queue(&record, peer.as_str())
            .await?;
        Ok(())
    }
}
