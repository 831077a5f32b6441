/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The four simulation rounds that are alive at any time.
//!
//! The rounds hold four consecutive indices and are named, in order, *current*, *next*, *next-next* and
//! *next-next-next*:
//! - *current* is the round whose frames are being executed,
//! - *next* must be fully committed before *current* ends, or the manager waits,
//! - *next-next* receives the commands that are generated while *current* executes, and
//! - *next-next-next* receives commands from peers that are one round ahead of the local peer.
//!
//! Rotation recycles *current* into the new *next-next-next* instead of allocating a new round.

use crate::types::{
    data_types::{PeerIndex, RoundIndex},
    membership::Membership,
};

use super::round::SimulationRound;

/// Number of rounds in the pipeline.
pub const PIPELINE_DEPTH: usize = 4;

/// Position of a round within the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Current = 0,
    Next = 1,
    NextNext = 2,
    NextNextNext = 3,
}

impl Stage {
    /// The stages that accept command submissions, earliest first.
    pub const UPCOMING: [Stage; 3] = [Stage::Next, Stage::NextNext, Stage::NextNextNext];
}

#[derive(Debug)]
pub struct RoundPipeline {
    rounds: [SimulationRound; PIPELINE_DEPTH],
}

impl RoundPipeline {
    pub fn new(peer_count: usize, max_frames: u32) -> Self {
        Self {
            rounds: [
                SimulationRound::new(peer_count, max_frames),
                SimulationRound::new(peer_count, max_frames),
                SimulationRound::new(peer_count, max_frames),
                SimulationRound::new(peer_count, max_frames),
            ],
        }
    }

    /// Reset the pipeline to rounds `0..4`, with round 0 pre-committed.
    pub fn reset(&mut self, membership: &Membership) {
        for (offset, round) in self.rounds.iter_mut().enumerate() {
            round.reset(offset == 0, RoundIndex::new(offset as u32), membership);
        }
    }

    /// Advance by one round: *current* is recycled as the new *next-next-next*.
    pub fn rotate(&mut self, membership: &Membership) {
        self.rounds.rotate_left(1);
        let index = self.rounds[PIPELINE_DEPTH - 2].index() + 1;
        self.rounds[PIPELINE_DEPTH - 1].reset(false, index, membership);
    }

    pub fn get(&self, stage: Stage) -> &SimulationRound {
        &self.rounds[stage as usize]
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut SimulationRound {
        &mut self.rounds[stage as usize]
    }

    pub fn current(&self) -> &SimulationRound {
        self.get(Stage::Current)
    }

    pub fn current_mut(&mut self) -> &mut SimulationRound {
        self.get_mut(Stage::Current)
    }

    pub fn next(&self) -> &SimulationRound {
        self.get(Stage::Next)
    }

    /// Find the stage of the round with the given index, if it is in the pipeline.
    pub fn stage_of(&self, index: RoundIndex) -> Option<Stage> {
        let offset = index.int().checked_sub(self.current().index().int())?;
        match offset {
            0 => Some(Stage::Current),
            1 => Some(Stage::Next),
            2 => Some(Stage::NextNext),
            3 => Some(Stage::NextNextNext),
            _ => None,
        }
    }

    /// Register that `peer` left, against the earliest upcoming round it has not committed yet.
    /// Returns the index of that round.
    pub fn leave(&mut self, peer: PeerIndex) -> Option<RoundIndex> {
        Stage::UPCOMING.iter().find_map(|stage| {
            let round = self.get_mut(*stage);
            round.leave(peer).then(|| round.index())
        })
    }

    /// The indices of the rounds, from *current* to *next-next-next*.
    pub fn indices(&self) -> [RoundIndex; PIPELINE_DEPTH] {
        [
            self.rounds[0].index(),
            self.rounds[1].index(),
            self.rounds[2].index(),
            self.rounds[3].index(),
        ]
    }
}
