//! Group membership known to this session.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use peerlink_proto::message::{GroupId, PeerId};

/// Members of every known group.
#[derive(Debug, Default)]
pub struct GroupRoster {
    groups: RwLock<HashMap<GroupId, HashSet<PeerId>>>,
}

impl GroupRoster {
    /// Creates an empty roster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the membership of `group`.
    pub fn insert(&self, group: GroupId, members: impl IntoIterator<Item = PeerId>) {
        self.groups
            .write()
            .insert(group, members.into_iter().collect());
    }

    /// Add one member. Returns `false` for unknown groups.
    pub fn add_member(&self, group: &GroupId, peer: PeerId) -> bool {
        self.groups
            .write()
            .get_mut(group)
            .is_some_and(|members| {
                members.insert(peer);
                true
            })
    }

    /// Remove one member. Returns `true` if it was present.
    pub fn remove_member(&self, group: &GroupId, peer: &PeerId) -> bool {
        self.groups
            .write()
            .get_mut(group)
            .is_some_and(|members| members.remove(peer))
    }

    /// Members of `group`, sorted, or `None` if the group is unknown.
    #[must_use]
    pub fn members(&self, group: &GroupId) -> Option<Vec<PeerId>> {
        self.groups.read().get(group).map(|members| {
            let mut members: Vec<PeerId> = members.iter().cloned().collect();
            members.sort();
            members
        })
    }

    /// Whether `group` is known.
    #[must_use]
    pub fn contains(&self, group: &GroupId) -> bool {
        self.groups.read().contains_key(group)
    }

    /// Number of known groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// Whether no groups are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
