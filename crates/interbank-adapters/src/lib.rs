//! Peer transports for interbank settlement nodes.

#![deny(unsafe_code)]

mod http;
mod network;

pub use http::{HttpPeerClient, PeerTimeouts};
pub use network::{InProcessPeerNetwork, UnreachablePeers};
