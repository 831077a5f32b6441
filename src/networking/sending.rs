/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions and types for sending messages to the P2P network.

use crate::messages::Message;
use crate::types::data_types::PeerIndex;

use super::network::Network;

/// Handle for sending and broadcasting [`Message`]s to the [`Network`].
#[derive(Clone)]
pub(crate) struct SenderHandle<N: Network> {
    network: N,
}

impl<N: Network> SenderHandle<N> {
    pub(crate) fn new(network: N) -> Self {
        Self { network }
    }

    pub(crate) fn send(&mut self, peer: PeerIndex, msg: Message) {
        self.network.send(&[peer], msg.encode())
    }

    pub(crate) fn broadcast(&mut self, msg: Message) {
        self.network.broadcast(msg.encode())
    }
}
