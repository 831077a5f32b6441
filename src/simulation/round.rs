/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The unit of pipelining: a batch of consecutive frames sharing one commit exchange.
//!
//! A [`SimulationRound`] buffers the commands every peer submitted for each of its frame slots, tracks
//! which peers have committed (or left during) the round, and, once the round is fully committed,
//! derives its pacing: how long each frame should take, and how many frames the round has.
//!
//! ## Pacing
//!
//! Every commit carries the sender's average frame time (AFT) and average ping time (APT). The round
//! keeps the highest of each, and once committed computes:
//! - `target_frame_time = clamp(highest_aft, min_target_frame_time, max_target_frame_time)`, and
//! - `frame_count = clamp(highest_apt / target_frame_time + 1, min_frames, max_frames)`.
//!
//! A round therefore batches more frames when the slowest link is slow relative to the cost of a frame,
//! amortizing one network round trip over many locally executed frames.
//!
//! ## Late commands
//!
//! Commands are addressed to a frame slot in `0..max_frames`, before the round's frame count is known.
//! Commands addressed to slots at or beyond the last frame are folded into the last frame, in slot order.
//!
//! Rounds are allocated once per pipeline position and [reset](SimulationRound::reset) when recycled.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::{
    data_types::{Command, FrameIndex, FrameTime, PeerIndex, RoundIndex, StateHash},
    membership::Membership,
};

/// Bounds that a round's pacing is clamped to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacingLimits {
    pub min_target_frame_time: Duration,
    pub max_target_frame_time: Duration,
    pub min_frames: u32,
    pub max_frames: u32,
}

/// Pacing of a committed round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundPacing {
    pub target_frame_time: Duration,
    pub frame_count: u32,
}

impl RoundPacing {
    /// Derive the pacing of a round from the highest average frame time and highest average ping time
    /// reported by its committers.
    pub fn derive(highest_aft: FrameTime, highest_apt: FrameTime, limits: &PacingLimits) -> Self {
        let min_tft = limits.min_target_frame_time.as_millis() as u64;
        let max_tft = (limits.max_target_frame_time.as_millis() as u64).max(min_tft);
        let target_frame_time = (highest_aft.millis() as u64).clamp(min_tft, max_tft);

        let frames = match target_frame_time {
            0 => limits.max_frames as u64,
            tft => highest_apt.millis() as u64 / tft + 1,
        };
        let max_frames = limits.max_frames.max(limits.min_frames) as u64;
        let frame_count = frames.clamp(limits.min_frames as u64, max_frames) as u32;

        Self {
            target_frame_time: Duration::from_millis(target_frame_time),
            frame_count,
        }
    }
}

#[derive(Debug)]
pub struct SimulationRound {
    index: RoundIndex,
    max_frames: usize,
    // commands[frame slot][peer slot]
    commands: Vec<Vec<Option<Vec<Command>>>>,
    committed: Vec<bool>,
    leaving: BTreeSet<PeerIndex>,
    cursor: usize,
    highest_aft: FrameTime,
    highest_apt: FrameTime,
    state_hash: Option<StateHash>,
    pacing: Option<RoundPacing>,
}

impl SimulationRound {
    /// Allocate a round for `peer_count` peers and up to `max_frames` frame slots. The new round has
    /// index 0 and nobody has committed it.
    pub fn new(peer_count: usize, max_frames: u32) -> Self {
        let max_frames = (max_frames as usize).max(1);
        Self {
            index: RoundIndex::init(),
            max_frames,
            commands: vec![vec![None; peer_count]; max_frames],
            committed: vec![false; peer_count],
            leaving: BTreeSet::new(),
            cursor: 0,
            highest_aft: FrameTime::default(),
            highest_apt: FrameTime::default(),
            state_hash: None,
            pacing: None,
        }
    }

    /// Reinitialize this round as round `index`. If `pre_committed`, every active peer is counted as
    /// having committed already.
    pub fn reset(&mut self, pre_committed: bool, index: RoundIndex, membership: &Membership) {
        self.index = index;
        self.commands
            .iter_mut()
            .flat_map(|frame| frame.iter_mut())
            .for_each(|slot| *slot = None);
        for (slot, committed) in self.committed.iter_mut().enumerate() {
            *committed = pre_committed && membership.is_active(PeerIndex::new(slot));
        }
        self.leaving.clear();
        self.cursor = 0;
        self.highest_aft = FrameTime::default();
        self.highest_apt = FrameTime::default();
        self.state_hash = None;
        self.pacing = None;
    }

    /// Register `sender`'s commit for this round.
    ///
    /// Returns `false` if `sender` already committed (or left) this round, or if `state_hash` differs
    /// from the hash of the first committer, which means the peers' simulations have diverged.
    pub fn commit(
        &mut self,
        sender: PeerIndex,
        sender_aft: FrameTime,
        sender_apt: FrameTime,
        state_hash: StateHash,
    ) -> bool {
        if !self.mark_committed(sender) {
            return false;
        }

        self.highest_aft = self.highest_aft.max(sender_aft);
        self.highest_apt = self.highest_apt.max(sender_apt);

        match &self.state_hash {
            None => {
                self.state_hash = Some(state_hash);
                true
            }
            Some(reference) => *reference == state_hash,
        }
    }

    /// Register that `sender` left the session, which counts as its commit for this round.
    ///
    /// Returns `false` if `sender` already committed (or left) this round, or is the host.
    pub fn leave(&mut self, sender: PeerIndex) -> bool {
        if sender.is_host() || !self.mark_committed(sender) {
            return false;
        }
        self.leaving.insert(sender);
        true
    }

    fn mark_committed(&mut self, sender: PeerIndex) -> bool {
        match self.committed.get_mut(sender.int()) {
            Some(committed) if !*committed => {
                *committed = true;
                true
            }
            _ => false,
        }
    }

    /// Whether every active peer has committed or left during this round.
    pub fn is_committed(&self, membership: &Membership) -> bool {
        membership
            .active_peers()
            .all(|peer| self.committed.get(peer.int()).copied().unwrap_or(false))
    }

    /// Compute the round's pacing. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if the round is not fully committed.
    pub fn compute_pacing(&mut self, membership: &Membership, limits: &PacingLimits) -> RoundPacing {
        assert!(
            self.is_committed(membership),
            "Programming error: computing the pacing of uncommitted round {}.",
            self.index
        );
        if let Some(pacing) = self.pacing {
            return pacing;
        }
        let mut pacing = RoundPacing::derive(self.highest_aft, self.highest_apt, limits);
        pacing.frame_count = pacing.frame_count.min(self.max_frames as u32);
        self.pacing = Some(pacing);
        pacing
    }

    /// Buffer `commands` submitted by `peer` for `frame`.
    ///
    /// Returns `false` if `peer` already committed this round, if `frame` is out of range, if `peer`
    /// already submitted commands for `frame`, or if any command is malformed.
    pub fn submit_commands(&mut self, commands: Vec<Command>, peer: PeerIndex, frame: FrameIndex) -> bool {
        if self.committed.get(peer.int()).copied().unwrap_or(true) {
            return false;
        }
        if !commands.iter().all(Command::is_well_formed) {
            return false;
        }
        match self
            .commands
            .get_mut(frame.as_slot())
            .and_then(|slots| slots.get_mut(peer.int()))
        {
            Some(slot) if slot.is_none() => {
                *slot = Some(commands);
                true
            }
            _ => false,
        }
    }

    /// Take the commands `peer` submitted for the current frame. On the last frame of the round, this
    /// also takes every command `peer` addressed to later frame slots, in slot order.
    ///
    /// # Panics
    ///
    /// Panics if the round's pacing has not been computed.
    pub fn commands_for(&mut self, peer: PeerIndex) -> Option<Vec<Command>> {
        let last_slot = if self.is_last_frame() {
            self.max_frames
        } else {
            self.cursor + 1
        };

        let mut commands: Option<Vec<Command>> = None;
        for frame in &mut self.commands[self.cursor..last_slot] {
            if let Some(submitted) = frame.get_mut(peer.int()).and_then(Option::take) {
                commands.get_or_insert_with(Vec::new).extend(submitted);
            }
        }
        commands
    }

    /// Move to the next frame. Returns `false` (and does nothing) if the cursor is on the last frame.
    ///
    /// # Panics
    ///
    /// Panics if the round's pacing has not been computed.
    pub fn advance_frame(&mut self) -> bool {
        if self.is_last_frame() {
            return false;
        }
        self.cursor += 1;
        true
    }

    fn is_last_frame(&self) -> bool {
        let pacing = self
            .pacing
            .expect("Programming error: accessing the frames of a round whose pacing is not computed.");
        self.cursor + 1 >= pacing.frame_count as usize
    }

    pub fn index(&self) -> RoundIndex {
        self.index
    }

    /// The frame the cursor is on.
    pub fn frame(&self) -> FrameIndex {
        FrameIndex::new(self.cursor as u32)
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    pub fn pacing(&self) -> Option<RoundPacing> {
        self.pacing
    }

    pub fn highest_aft(&self) -> FrameTime {
        self.highest_aft
    }

    pub fn highest_apt(&self) -> FrameTime {
        self.highest_apt
    }

    pub fn state_hash(&self) -> Option<&StateHash> {
        self.state_hash.as_ref()
    }

    pub fn has_committed(&self, peer: PeerIndex) -> bool {
        self.committed.get(peer.int()).copied().unwrap_or(false)
    }

    /// Peers that left the session during this round, in slot order.
    pub fn leaving_peers(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        self.leaving.iter().copied()
    }
}
