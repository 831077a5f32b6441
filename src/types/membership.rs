/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The operator membership vector.
//!
//! A [`Membership`] holds one flag per peer slot (slot 0 is the host), which is `true` iff that peer is
//! currently participating in the simulation. Rounds and commit monitors never own a membership; they
//! are evaluated against the manager's single instance, which is only mutated between dispatched events.
//!
//! A slot can only go from active to inactive, never back.

use super::data_types::PeerIndex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership(Vec<bool>);

impl Membership {
    /// Create a membership from raw per-slot flags.
    pub fn new(flags: Vec<bool>) -> Self {
        Self(flags)
    }

    /// Create a membership of `len` slots, all of them active.
    pub fn all_active(len: usize) -> Self {
        Self(vec![true; len])
    }

    /// Number of peer slots, active or not.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `peer` is a valid slot in this membership.
    pub fn contains(&self, peer: PeerIndex) -> bool {
        peer.int() < self.0.len()
    }

    /// Whether `peer` is currently participating. Out-of-range slots are never active.
    pub fn is_active(&self, peer: PeerIndex) -> bool {
        self.0.get(peer.int()).copied().unwrap_or(false)
    }

    /// Mark `peer` as no longer participating. Returns whether the flag changed.
    pub(crate) fn remove(&mut self, peer: PeerIndex) -> bool {
        match self.0.get_mut(peer.int()) {
            Some(flag) if *flag => {
                *flag = false;
                true
            }
            _ => false,
        }
    }

    /// Iterate over the slots that are currently participating.
    pub fn active_peers(&self) -> impl Iterator<Item = PeerIndex> + '_ {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .map(|(slot, _)| PeerIndex::new(slot))
    }

    /// Iterate over every slot, active or not.
    pub fn peers(&self) -> impl Iterator<Item = PeerIndex> {
        (0..self.0.len()).map(PeerIndex::new)
    }
}
