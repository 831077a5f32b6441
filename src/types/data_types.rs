/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! "Inert" types, i.e., those that are sent around and inspected, but have no active behavior.
//!
//! These types follow the newtype pattern, and the API for using them is defined in this module.

use std::{
    fmt::{self, Display, Formatter},
    ops::Add,
};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

/// Slot of an operator in the session. Slot 0 is always the host, slots `1..N` are guests.
///
/// Peer indices are transport-level metadata and never appear inside a wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerIndex(usize);

impl PeerIndex {
    /// The slot of the host.
    pub const HOST: PeerIndex = PeerIndex(0);

    /// Create a new `PeerIndex` wrapping `int`.
    pub const fn new(int: usize) -> Self {
        Self(int)
    }

    /// Get the inner `usize` of this `PeerIndex`.
    pub const fn int(&self) -> usize {
        self.0
    }

    pub const fn is_host(&self) -> bool {
        self.0 == 0
    }
}

impl Display for PeerIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Index of a simulation round. Round indices increase monotonically over the lifetime of a session,
/// starting from 0.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct RoundIndex(u32);

impl RoundIndex {
    /// Create a new `RoundIndex` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the initial `RoundIndex`, which is 0.
    pub const fn init() -> Self {
        Self(0)
    }

    /// Get the inner `u32` of this `RoundIndex`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for RoundIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u32> for RoundIndex {
    type Output = RoundIndex;

    fn add(self, rhs: u32) -> Self::Output {
        RoundIndex(self.0 + rhs)
    }
}

/// Index of a frame slot within a round.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct FrameIndex(u32);

impl FrameIndex {
    /// Create a new `FrameIndex` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `FrameIndex`.
    pub const fn int(&self) -> u32 {
        self.0
    }

    pub const fn as_slot(&self) -> usize {
        self.0 as usize
    }
}

impl Display for FrameIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Randomly generated identifier of a broadcast commit. Acknowledgements echo it back.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Ticket(u32);

impl Ticket {
    /// Create a new `Ticket` wrapping `int`.
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    /// Get the inner `u32` of this `Ticket`.
    pub const fn int(&self) -> u32 {
        self.0
    }
}

impl Display for Ticket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A duration in whole milliseconds, as reported on the wire for the average frame time (AFT) and
/// the average ping time (APT).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct FrameTime(u16);

impl FrameTime {
    /// Create a new `FrameTime` wrapping `millis`.
    pub const fn new(millis: u16) -> Self {
        Self(millis)
    }

    /// Convert a number of milliseconds into a `FrameTime`, saturating at [`u16::MAX`].
    pub fn from_millis(millis: u64) -> Self {
        Self(u16::try_from(millis).unwrap_or(u16::MAX))
    }

    /// Get the inner number of milliseconds.
    pub const fn millis(&self) -> u16 {
        self.0
    }
}

impl Display for FrameTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// An opaque command produced by a client for a single frame. The synchronization core never looks
/// inside a command; it only checks that it is non-empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct Command(Vec<u8>);

impl Command {
    /// Create a new `Command` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get a reference to the bytes of this `Command`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    /// A command is structurally valid iff it carries at least one byte.
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
    }
}

/// Digest of a client's simulation state, compared byte-for-byte between peers to detect silent
/// divergence.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct StateHash(Vec<u8>);

impl StateHash {
    /// Create a new `StateHash` wrapping `bytes`.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Compute the SHA-256 digest of `state`.
    pub fn digest(state: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(state);
        Self(hasher.finalize().to_vec())
    }

    /// Get a reference to the bytes of this `StateHash`.
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}
