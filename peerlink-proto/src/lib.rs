//! Shared protocol definitions for the `PeerLink` wire formats.
//!
//! Three formats live here: the [`message::Message`] carried inside
//! encrypted data-channel envelopes, the [`codec::SealedEnvelope`] that
//! wraps it on the wire, and the [`signal::SignalMessage`] frames
//! exchanged with the signaling relay.

pub mod codec;
pub mod message;
pub mod presence;
pub mod signal;
