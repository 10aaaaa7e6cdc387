//! `PeerLink` — peer connection management and message delivery for
//! peer-to-peer encrypted chat.
//!
//! [`service::PeerService`] is the entry point: it negotiates direct data
//! channels through a signaling relay, seals every message with the session
//! key, queues messages while peers are unreachable and acknowledges what it
//! receives.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod group;
pub mod notice;
pub mod peer;
pub mod presence;
pub mod rtc;
pub mod service;
pub mod signal;
pub mod store;
