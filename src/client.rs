/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait definition for the simulation that the synchronization core drives.
//!
//! Implementors of [`SimulationClient`] step the actual game state. Every peer's client is fed the same
//! commands in the same order, frame by frame, so the client must be *deterministic*: given the same
//! sequence of calls, it must arrive at the same state (and therefore return the same
//! [state hash](SimulationClient::state_hash)) on every peer.
//!
//! Within a frame, the call sequence is:
//! 1. [`deliver_host_command`](SimulationClient::deliver_host_command) for each of the host's commands,
//! 2. [`deliver_guest_command`](SimulationClient::deliver_guest_command) for each command of each guest,
//!    in ascending slot order,
//! 3. [`execute_frame`](SimulationClient::execute_frame).

use crate::types::data_types::{Command, PeerIndex, StateHash};

pub trait SimulationClient: Send + 'static {
    /// Step the simulation by one frame, returning the commands the local operator issued during it, or
    /// a request to leave the session.
    fn execute_frame(&mut self) -> ExecuteFrameResponse;

    /// Apply a command issued by the host.
    fn deliver_host_command(&mut self, command: Command);

    /// Apply a command issued by the guest in slot `peer`.
    fn deliver_guest_command(&mut self, peer: PeerIndex, command: Command);

    /// Digest of the current simulation state. Called at round boundaries, when every peer has executed
    /// exactly the same frames.
    fn state_hash(&mut self) -> StateHash;

    /// The session ended because of a fatal error. `payload` is opaque context from the peer that
    /// reported the error, if any.
    fn on_simulation_error(&mut self, reason: &str, payload: &[u8]);

    /// The guest in slot `peer` left. Called at the start of the first round the guest no longer takes
    /// part in.
    fn on_peer_left(&mut self, peer: PeerIndex);

    /// The host left. The session ends after this call.
    fn on_host_left(&mut self);
}

/// What the client wants after executing a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecuteFrameResponse {
    /// Keep going, and distribute `commands` to every peer.
    Continue { commands: Vec<Command> },

    /// Leave the session, telling the other peers `reason` and `custom`.
    Stop { reason: String, custom: Vec<u8> },
}

impl ExecuteFrameResponse {
    pub fn idle() -> Self {
        ExecuteFrameResponse::Continue { commands: Vec::new() }
    }
}
