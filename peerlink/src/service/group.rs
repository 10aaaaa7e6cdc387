//! Group methods for [`PeerService`]: naive fan-out over the roster.

use peerlink_proto::message::{GroupId, Message, MessageBody, PeerId, Recipient};

use crate::delivery::SendOutcome;
use crate::rtc::RtcBackend;
use crate::signal::SignalSender;
use crate::store::{ExternalStore, StoreError};

use super::PeerService;

impl<B: RtcBackend, S: SignalSender, St: ExternalStore> PeerService<B, S, St> {
    /// Send a group message to every member but ourselves.
    ///
    /// Returns `true` if at least one member got it over an open channel.
    pub async fn send_group_message(&self, message: Message) -> bool {
        if let Err(e) = message.validate() {
            tracing::warn!(message_id = %message.id, error = %e, "rejecting invalid group message");
            return false;
        }
        self.fan_out(message).await == SendOutcome::Sent
    }

    /// Create a group with `members`, record it locally and announce it to
    /// every member.
    ///
    /// # Errors
    ///
    /// Returns the store error if the group cannot be persisted.
    pub async fn create_group(
        &self,
        name: &str,
        members: &[PeerId],
    ) -> Result<GroupId, StoreError> {
        let group_id = self
            .store
            .create_group(name, &self.local_id, members)
            .await?;

        let mut all: Vec<PeerId> = members.to_vec();
        if !all.contains(&self.local_id) {
            all.push(self.local_id.clone());
        }
        self.roster.insert(group_id.clone(), all.iter().cloned());
        tracing::info!(group = %group_id, name, members = all.len(), "group created");

        let announcement = Message::new(
            self.local_id.clone(),
            Recipient::Group(group_id.clone()),
            MessageBody::GroupCreated {
                group_id: group_id.clone(),
                name: name.to_string(),
                members: all,
            },
        );
        self.fan_out(announcement).await;
        Ok(group_id)
    }

    /// Populate the roster with every group the local peer belongs to.
    /// Returns the number of groups loaded.
    ///
    /// # Errors
    ///
    /// Returns the store error if the groups cannot be read.
    pub async fn load_groups(&self) -> Result<usize, StoreError> {
        let groups = self.store.get_user_groups(&self.local_id).await?;
        let count = groups.len();
        for group in groups {
            self.roster.insert(group.id, group.members);
        }
        tracing::debug!(count, "groups loaded");
        Ok(count)
    }

    /// Hand a copy of `message` to every roster member except ourselves.
    pub(super) async fn fan_out(&self, message: Message) -> SendOutcome {
        let Recipient::Group(group) = &message.recipient else {
            tracing::warn!(recipient = %message.recipient, "fan-out needs a group recipient");
            return SendOutcome::Failed;
        };
        let Some(members) = self.roster.members(group) else {
            tracing::warn!(group = %group, "unknown group");
            return SendOutcome::Failed;
        };

        let mut outcomes = Vec::with_capacity(members.len());
        for member in members.iter().filter(|m| **m != self.local_id) {
            outcomes.push(self.send_to_peer(member, message.clone()).await);
        }
        let outcome = SendOutcome::combine(outcomes);
        tracing::debug!(group = %group, outcome = %outcome, "group fan-out");
        outcome
    }
}
