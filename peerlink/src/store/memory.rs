//! In-memory [`ExternalStore`] for tests and the demo binary.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use peerlink_proto::message::{GroupId, PeerId, UserId};
use peerlink_proto::presence::PresenceStatus;

use super::{
    ExternalStore, GroupRecord, NewMessage, OfflineEntry, OfflineStatus, RecordId, StoreError,
    StoredMessage,
};

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    messages: Vec<StoredMessage>,
    offline: Vec<OfflineEntry>,
    statuses: Vec<(UserId, PresenceStatus)>,
    groups: Vec<GroupRecord>,
}

impl StoreInner {
    fn id(&mut self, prefix: &str) -> RecordId {
        self.next_id += 1;
        RecordId::new(format!("{prefix}-{}", self.next_id))
    }
}

/// Cloneable in-memory store; clones share the same data, so two sessions
/// in one test can use it as their common backend.
///
/// [`set_available`](Self::set_available) makes every operation fail with
/// [`StoreError::Unavailable`] to exercise fallback paths.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty, available store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle simulated availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Every saved message.
    #[must_use]
    pub fn messages(&self) -> Vec<StoredMessage> {
        self.inner.lock().messages.clone()
    }

    /// Every offline queue entry, in any state.
    #[must_use]
    pub fn offline_entries(&self) -> Vec<OfflineEntry> {
        self.inner.lock().offline.clone()
    }

    /// Every presence update, in order.
    #[must_use]
    pub fn status_updates(&self) -> Vec<(UserId, PresenceStatus)> {
        self.inner.lock().statuses.clone()
    }

    /// Every group.
    #[must_use]
    pub fn groups(&self) -> Vec<GroupRecord> {
        self.inner.lock().groups.clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store disabled".to_string()))
        }
    }
}

impl ExternalStore for InMemoryStore {
    async fn save_message(&self, message: NewMessage) -> Result<RecordId, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let id = inner.id("msg");
        inner.messages.push(StoredMessage {
            id: id.clone(),
            message,
            delivered: false,
        });
        Ok(id)
    }

    async fn add_to_offline_queue(
        &self,
        message: &RecordId,
        recipient_id: &str,
    ) -> Result<RecordId, StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let stored = inner
            .messages
            .iter()
            .find(|m| &m.id == message)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message.to_string()))?;
        let id = inner.id("offline");
        inner.offline.push(OfflineEntry {
            id: id.clone(),
            recipient_id: recipient_id.to_string(),
            status: OfflineStatus::Queued,
            message: stored,
        });
        Ok(id)
    }

    async fn get_offline_messages(&self, recipient_id: &str) -> Result<Vec<OfflineEntry>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .offline
            .iter()
            .filter(|e| e.recipient_id == recipient_id && e.status == OfflineStatus::Queued)
            .cloned()
            .collect())
    }

    async fn mark_message_delivered(&self, message: &RecordId) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let stored = inner
            .messages
            .iter_mut()
            .find(|m| &m.id == message)
            .ok_or_else(|| StoreError::NotFound(message.to_string()))?;
        stored.delivered = true;
        for entry in inner.offline.iter_mut().filter(|e| &e.message.id == message) {
            entry.status = OfflineStatus::Delivered;
            entry.message.delivered = true;
        }
        Ok(())
    }

    async fn remove_from_offline_queue(&self, entry: &RecordId) -> Result<(), StoreError> {
        self.check()?;
        let mut inner = self.inner.lock();
        let before = inner.offline.len();
        inner.offline.retain(|e| &e.id != entry);
        if inner.offline.len() == before {
            return Err(StoreError::NotFound(entry.to_string()));
        }
        Ok(())
    }

    async fn update_connection_status(
        &self,
        user: &UserId,
        status: PresenceStatus,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.lock().statuses.push((user.clone(), status));
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        created_by: &PeerId,
        members: &[PeerId],
    ) -> Result<GroupId, StoreError> {
        self.check()?;
        let mut all = members.to_vec();
        if !all.contains(created_by) {
            all.push(created_by.clone());
        }
        let id = GroupId::new();
        self.inner.lock().groups.push(GroupRecord {
            id: id.clone(),
            name: name.to_string(),
            created_by: created_by.clone(),
            members: all,
        });
        Ok(id)
    }

    async fn get_user_groups(&self, peer: &PeerId) -> Result<Vec<GroupRecord>, StoreError> {
        self.check()?;
        Ok(self
            .inner
            .lock()
            .groups
            .iter()
            .filter(|g| g.members.contains(peer))
            .cloned()
            .collect())
    }
}
