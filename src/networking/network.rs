/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The transport contract.
//!
//! The synchronization core does not establish connections or discover peers. It is handed a
//! [`Network`] whose peers are already known by their [`PeerIndex`], and exchanges opaque byte frames
//! over it. The core only relies on frames sent to the same peer being delivered in the order they
//! were sent; lost frames surface as commit or acknowledgement timeouts.

use crate::types::data_types::PeerIndex;

/// Something the transport observed about a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A frame arrived from `origin`.
    Message { origin: PeerIndex, frame: Vec<u8> },

    /// The transport lost its connection to a peer. The peer is treated as having left.
    Disconnected(PeerIndex),
}

pub trait Network: Clone + Send {
    /// Send a frame to every other peer in the session without blocking.
    fn broadcast(&mut self, frame: Vec<u8>);

    /// Send a frame to the specified peers without blocking.
    fn send(&mut self, peers: &[PeerIndex], frame: Vec<u8>);

    /// Receive the next event from any peer. Returns immediately with a `None` if nothing is available now.
    fn recv(&mut self) -> Option<NetworkEvent>;
}
