/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of simulation-stage events for event handling and logging.
//!
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::messages::Commit;
use crate::simulation::manager::Termination;
use crate::simulation::round::RoundPacing;
use crate::types::data_types::{FrameTime, PeerIndex, RoundIndex, StateHash, Ticket};

pub enum Event {
    // Events that involve broadcasting or receiving a commit.
    Commit(CommitEvent),
    ReceiveCommit(ReceiveCommitEvent),
    ReceiveCommitAck(ReceiveCommitAckEvent),
    // Round pipeline events.
    StartRound(StartRoundEvent),
    WaitForCommit(WaitForCommitEvent),
    ResumeFromWait(ResumeFromWaitEvent),
    // Membership events.
    PeerLeft(PeerLeftEvent),
    HostLeft(HostLeftEvent),
    // Session end events.
    SimulationError(SimulationErrorEvent),
    Terminate(TerminateEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away when the session is being shut down.
            let _ = event_publisher.send(event);
        }
    }
}

/// The local peer broadcast its commit for `round`.
pub struct CommitEvent {
    pub timestamp: SystemTime,
    pub round: RoundIndex,
    pub ticket: Ticket,
    pub aft: FrameTime,
    pub apt: FrameTime,
    pub state_hash: StateHash,
}

pub struct ReceiveCommitEvent {
    pub timestamp: SystemTime,
    pub origin: PeerIndex,
    pub commit: Commit,
}

pub struct ReceiveCommitAckEvent {
    pub timestamp: SystemTime,
    pub origin: PeerIndex,
    pub ticket: Ticket,
    pub round_trip: Duration,
}

/// `round` became the current round and its first frame is about to be scheduled.
pub struct StartRoundEvent {
    pub timestamp: SystemTime,
    pub round: RoundIndex,
    pub pacing: RoundPacing,
}

/// The current round ended, but `round` (the next round) is not fully committed yet.
pub struct WaitForCommitEvent {
    pub timestamp: SystemTime,
    pub round: RoundIndex,
}

/// `round` became fully committed while the manager was waiting for it.
pub struct ResumeFromWaitEvent {
    pub timestamp: SystemTime,
    pub round: RoundIndex,
    pub waited: Duration,
}

pub struct PeerLeftEvent {
    pub timestamp: SystemTime,
    pub peer: PeerIndex,
    /// The round the departure was registered against, if the peer had one left to commit.
    pub round: Option<RoundIndex>,
    pub reason: String,
}

pub struct HostLeftEvent {
    pub timestamp: SystemTime,
    pub reason: String,
}

pub struct SimulationErrorEvent {
    pub timestamp: SystemTime,
    pub reason: String,
}

pub struct TerminateEvent {
    pub timestamp: SystemTime,
    pub termination: Termination,
}
