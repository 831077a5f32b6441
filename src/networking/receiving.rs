/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving frames from the P2P network.
//!
//! Frames are not decoded here. The poller only marshals them onto the simulation thread's event queue,
//! so that a malformed frame is reported by the same thread that handles every other protocol error.

use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::session::SessionEvent;

use super::network::{Network, NetworkEvent};

/// Spawn the poller thread, which polls the [`Network`] and pushes everything it receives onto `events`.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    events: SyncSender<SessionEvent>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("Poller thread disconnected from main thread")
            }
        }

        if let Some(network_event) = network.recv() {
            let event = match network_event {
                NetworkEvent::Message { origin, frame } => SessionEvent::Message { origin, frame },
                NetworkEvent::Disconnected(peer) => SessionEvent::Disconnected(peer),
            };
            // Once the simulation thread has terminated there is nobody left to deliver to, but the
            // poller keeps draining the network until it is told to shut down.
            let _ = events.send(event);
        } else {
            thread::yield_now()
        }
    })
}
