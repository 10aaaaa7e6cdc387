//! Presence tracking and heartbeat.
//!
//! Peers are assumed online until the relay says otherwise; only the
//! offline set is tracked. The heartbeat periodically records the local
//! user as online in the external store.

use std::collections::HashSet;

use parking_lot::RwLock;

use peerlink_proto::message::{PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;

use crate::store::{ExternalStore, StoreError};

/// Peers currently known to be offline.
#[derive(Debug, Default)]
pub struct PresenceSet {
    offline: RwLock<HashSet<PeerId>>,
}

impl PresenceSet {
    /// Creates a set in which everyone is presumed online.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `peer` offline. Returns `true` if this changed anything.
    pub fn mark_offline(&self, peer: &PeerId) -> bool {
        self.offline.write().insert(peer.clone())
    }

    /// Mark `peer` online. Returns `true` if this changed anything.
    pub fn mark_online(&self, peer: &PeerId) -> bool {
        self.offline.write().remove(peer)
    }

    /// Apply a status. Returns `true` if this changed anything.
    pub fn apply(&self, peer: &PeerId, status: PresenceStatus) -> bool {
        match status {
            PresenceStatus::Online => self.mark_online(peer),
            PresenceStatus::Offline => self.mark_offline(peer),
        }
    }

    /// Whether `peer` is known to be offline.
    #[must_use]
    pub fn is_offline(&self, peer: &PeerId) -> bool {
        self.offline.read().contains(peer)
    }

    /// The status last reported for `peer`.
    #[must_use]
    pub fn status(&self, peer: &PeerId) -> PresenceStatus {
        if self.is_offline(peer) {
            PresenceStatus::Offline
        } else {
            PresenceStatus::Online
        }
    }
}

/// One heartbeat: record `user` as online.
///
/// Returns `Ok(false)` without touching the store when no user is
/// authenticated.
///
/// # Errors
///
/// Returns the store error if the update fails.
pub async fn heartbeat<St: ExternalStore>(
    store: &St,
    user: Option<&UserId>,
) -> Result<bool, StoreError> {
    let Some(user) = user else {
        return Ok(false);
    };
    store
        .update_connection_status(user, PresenceStatus::Online)
        .await?;
    tracing::trace!(user = %user.as_str(), "heartbeat recorded");
    Ok(true)
}
