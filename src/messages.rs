/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for structured messages that are sent between peers during the simulation stage.
//!
//! Messages are serialized with [borsh](https://docs.rs/borsh): integers are fixed-width little endian,
//! byte strings and vectors are prefixed with their `u32` length, and the [`Message`] variant is a
//! one-byte tag. [`Message::decode`] rejects unknown tags, truncated fields and trailing bytes alike.

use std::fmt::{self, Display, Formatter};
use std::io;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::data_types::{Command, FrameIndex, FrameTime, RoundIndex, StateHash, Ticket};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Message {
    Commit(Commit),
    CommitAck(CommitAck),
    CommandBatch(CommandBatch),
    Leave(Leave),
    SimulationError(SimulationErrorNotice),
}

impl Message {
    pub fn commit(
        aft: FrameTime,
        apt: FrameTime,
        round: RoundIndex,
        ticket: Ticket,
        state_hash: StateHash,
    ) -> Message {
        Message::Commit(Commit {
            aft,
            apt,
            round,
            ticket,
            state_hash,
        })
    }

    pub fn commit_ack(ticket: Ticket) -> Message {
        Message::CommitAck(CommitAck { ticket })
    }

    pub fn command_batch(round: RoundIndex, frame: FrameIndex, commands: Vec<Command>) -> Message {
        Message::CommandBatch(CommandBatch {
            round,
            frame,
            commands,
        })
    }

    pub fn leave(reason: String, custom: Vec<u8>) -> Message {
        Message::Leave(Leave { reason, custom })
    }

    pub fn simulation_error(reason: String, custom: Vec<u8>) -> Message {
        Message::SimulationError(SimulationErrorNotice { reason, custom })
    }

    /// Serialize this message into a frame for the network.
    pub fn encode(&self) -> Vec<u8> {
        // Safety: serializing into a `Vec` cannot fail.
        self.try_to_vec().unwrap()
    }

    /// Deserialize a frame received from the network.
    pub fn decode(bytes: &[u8]) -> Result<Message, MessageDecodeError> {
        Message::try_from_slice(bytes).map_err(MessageDecodeError)
    }

    /// Name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Commit(_) => "Commit",
            Message::CommitAck(_) => "CommitAck",
            Message::CommandBatch(_) => "CommandBatch",
            Message::Leave(_) => "Leave",
            Message::SimulationError(_) => "SimulationError",
        }
    }
}

/// A peer's declaration that it is ready to execute `round`, together with the timing figures that
/// determine the round's pacing and a digest of its simulation state.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub aft: FrameTime,
    pub apt: FrameTime,
    pub round: RoundIndex,
    pub ticket: Ticket,
    pub state_hash: StateHash,
}

/// Answer to a [`Commit`], echoing its ticket.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommitAck {
    pub ticket: Ticket,
}

/// The commands a peer generated while executing one frame, addressed to `frame` of `round`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CommandBatch {
    pub round: RoundIndex,
    pub frame: FrameIndex,
    pub commands: Vec<Command>,
}

/// Notice that the sender is leaving the session.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Leave {
    pub reason: String,
    pub custom: Vec<u8>,
}

/// Notice that the sender hit a fatal simulation-stage error.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SimulationErrorNotice {
    pub reason: String,
    pub custom: Vec<u8>,
}

/// A frame received from the network could not be decoded into a [`Message`].
#[derive(Debug)]
pub struct MessageDecodeError(pub io::Error);

impl Display for MessageDecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "malformed message: {}", self.0)
    }
}

#[test]
fn decode_rejects_malformed_frames_test() {
    let leave = Message::leave(String::from("bye"), vec![1, 2]);
    let frame = leave.encode();
    assert_eq!(Message::decode(&frame).unwrap(), leave);

    // Truncated.
    assert!(Message::decode(&frame[..frame.len() - 1]).is_err());

    // Trailing bytes.
    let mut padded = frame.clone();
    padded.push(0);
    assert!(Message::decode(&padded).is_err());

    // Unknown variant tag.
    let mut unknown = frame;
    unknown[0] = 5;
    assert!(Message::decode(&unknown).is_err());
}
