//! `PeerLink` signaling relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, registers peers, broadcasts presence and
//! routes negotiation frames between them. It never sees chat traffic.

pub mod config;
pub mod relay;
