//! Data channel bookkeeping for one peer connection.

use crate::rtc::{ChannelId, ChannelState};

/// Who opened the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDirection {
    /// Created locally.
    Outbound,
    /// Announced by the remote side.
    Inbound,
}

/// One data channel as tracked by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChannel {
    /// Backend handle.
    pub id: ChannelId,
    /// Channel label.
    pub label: String,
    /// Current state.
    pub state: ChannelState,
    /// Always `true`: every channel is ordered and reliable.
    pub ordered: bool,
    /// Who opened it.
    pub direction: ChannelDirection,
}

/// Every channel belonging to a connection.
#[derive(Debug, Clone, Default)]
pub struct ChannelSet {
    channels: Vec<DataChannel>,
}

impl ChannelSet {
    /// Track a new channel. Re-adding a known id is a no-op.
    pub fn add(&mut self, id: ChannelId, label: impl Into<String>, direction: ChannelDirection) {
        if self.channels.iter().any(|c| c.id == id) {
            return;
        }
        self.channels.push(DataChannel {
            id,
            label: label.into(),
            state: ChannelState::Connecting,
            ordered: true,
            direction,
        });
    }

    /// Update a channel's state. Returns `false` for unknown channels.
    pub fn set_state(&mut self, id: ChannelId, state: ChannelState) -> bool {
        match self.channels.iter_mut().find(|c| c.id == id) {
            Some(channel) => {
                channel.state = state;
                true
            }
            None => false,
        }
    }

    /// The first open channel, preferring ones we created.
    #[must_use]
    pub fn first_open(&self) -> Option<ChannelId> {
        let open = || self.channels.iter().filter(|c| c.state == ChannelState::Open);
        open()
            .find(|c| c.direction == ChannelDirection::Outbound)
            .or_else(|| open().next())
            .map(|c| c.id)
    }

    /// Whether any channel is open.
    #[must_use]
    pub fn has_open(&self) -> bool {
        self.channels.iter().any(|c| c.state == ChannelState::Open)
    }

    /// Number of open channels.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state == ChannelState::Open)
            .count()
    }

    /// All tracked channels.
    pub fn iter(&self) -> impl Iterator<Item = &DataChannel> {
        self.channels.iter()
    }
}
