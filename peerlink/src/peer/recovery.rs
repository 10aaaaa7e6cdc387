//! Two-step recovery for failed connections.
//!
//! A `failed` or `disconnected` state counts as a failure. The first one
//! triggers an ICE restart. A failure while the restart is still pending
//! tears the connection down and builds a new one. Reaching `connected` at
//! any point resets the cycle.

use crate::rtc::ConnectionState;

/// Where a connection is in the recovery cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPhase {
    /// No recovery in progress.
    #[default]
    Stable,
    /// An ICE restart was attempted and has not succeeded yet.
    Restarting,
}

/// What to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Renegotiate with an ICE restart offer.
    IceRestart,
    /// Close the connection and create a new one after a delay.
    Recreate,
}

/// Advance the recovery cycle on a state change.
#[must_use]
pub const fn next(
    phase: RecoveryPhase,
    state: ConnectionState,
) -> (RecoveryPhase, Option<RecoveryAction>) {
    match (phase, state) {
        (_, ConnectionState::Connected) => (RecoveryPhase::Stable, None),
        (RecoveryPhase::Stable, ConnectionState::Failed | ConnectionState::Disconnected) => {
            (RecoveryPhase::Restarting, Some(RecoveryAction::IceRestart))
        }
        (RecoveryPhase::Restarting, ConnectionState::Failed | ConnectionState::Disconnected) => {
            (RecoveryPhase::Stable, Some(RecoveryAction::Recreate))
        }
        (phase, _) => (phase, None),
    }
}
