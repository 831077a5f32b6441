/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Tracks which active peers have acknowledged one outstanding broadcast commit.
//!
//! A [`CommitMonitor`] is created whenever the local peer broadcasts a commit, and is keyed by that
//! commit's randomly generated [`Ticket`]. Each acknowledgement yields a round trip time measurement,
//! which the manager feeds into that peer's ping average. The manager removes the monitor (and cancels
//! its answer timeout) once every active peer has acknowledged.

use std::fmt::{self, Display, Formatter};
use std::time::{Duration, Instant};

use crate::timer::TimerHandle;
use crate::types::{
    data_types::{PeerIndex, Ticket},
    membership::Membership,
};

#[derive(Debug)]
pub struct CommitMonitor {
    ticket: Ticket,
    timeout: TimerHandle,
    created_at: Instant,
    acknowledged: Vec<bool>,
    fully_acknowledged: bool,
}

impl CommitMonitor {
    /// Create a monitor for the commit identified by `ticket`, sent at `created_at`. The local peer is
    /// counted as having acknowledged already.
    ///
    /// # Errors
    ///
    /// Fails if `peer_count` is 0, if `me` is not a valid slot, or if `membership` does not have exactly
    /// `peer_count` slots.
    pub fn new(
        ticket: Ticket,
        timeout: TimerHandle,
        me: PeerIndex,
        peer_count: usize,
        membership: &Membership,
        created_at: Instant,
    ) -> Result<Self, CommitMonitorError> {
        if peer_count == 0 {
            return Err(CommitMonitorError::NoPeers);
        }
        if me.int() >= peer_count {
            return Err(CommitMonitorError::LocalPeerOutOfRange { me, peer_count });
        }
        if membership.len() != peer_count {
            return Err(CommitMonitorError::MembershipMismatch {
                membership_len: membership.len(),
                peer_count,
            });
        }

        let mut acknowledged = vec![false; peer_count];
        acknowledged[me.int()] = true;

        let mut monitor = Self {
            ticket,
            timeout,
            created_at,
            acknowledged,
            fully_acknowledged: false,
        };
        monitor.refresh(membership);
        Ok(monitor)
    }

    /// Register an acknowledgement from `sender` received at `now`.
    ///
    /// Returns the round trip time since the commit was sent, or `None` if `sender` already acknowledged
    /// (a duplicate or late answer) or is not a valid slot.
    pub fn acknowledge(
        &mut self,
        sender: PeerIndex,
        membership: &Membership,
        now: Instant,
    ) -> Option<Duration> {
        match self.acknowledged.get_mut(sender.int()) {
            Some(acknowledged) if !*acknowledged => *acknowledged = true,
            _ => return None,
        }
        self.refresh(membership);
        Some(now.saturating_duration_since(self.created_at))
    }

    /// Recompute whether the commit is fully acknowledged, e.g., after a peer left and its pending
    /// acknowledgement became irrelevant.
    pub fn refresh(&mut self, membership: &Membership) {
        self.fully_acknowledged = membership
            .active_peers()
            .all(|peer| self.acknowledged.get(peer.int()).copied().unwrap_or(true));
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn timeout(&self) -> TimerHandle {
        self.timeout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.fully_acknowledged
    }
}

/// Enumerates the ways [`CommitMonitor::new`] can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum CommitMonitorError {
    /// A monitor must cover at least one peer.
    NoPeers,

    /// The local peer is not one of the `peer_count` slots.
    LocalPeerOutOfRange { me: PeerIndex, peer_count: usize },

    /// The membership vector does not have `peer_count` slots.
    MembershipMismatch {
        membership_len: usize,
        peer_count: usize,
    },
}

impl Display for CommitMonitorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CommitMonitorError::NoPeers => write!(f, "commit monitor needs at least one peer"),
            CommitMonitorError::LocalPeerOutOfRange { me, peer_count } => {
                write!(f, "local peer {} is out of range for {} peers", me, peer_count)
            }
            CommitMonitorError::MembershipMismatch {
                membership_len,
                peer_count,
            } => write!(
                f,
                "membership has {} slots but {} peers were expected",
                membership_len, peer_count
            ),
        }
    }
}

#[test]
fn commit_monitor_constructor_preconditions_test() {
    let membership = Membership::all_active(3);
    let now = Instant::now();
    let timeout = TimerHandle::new(0);

    assert_eq!(
        CommitMonitor::new(Ticket::new(1), timeout, PeerIndex::new(0), 0, &membership, now).unwrap_err(),
        CommitMonitorError::NoPeers
    );
    assert!(matches!(
        CommitMonitor::new(Ticket::new(1), timeout, PeerIndex::new(3), 3, &membership, now),
        Err(CommitMonitorError::LocalPeerOutOfRange { .. })
    ));
    assert!(matches!(
        CommitMonitor::new(Ticket::new(1), timeout, PeerIndex::new(0), 2, &membership, now),
        Err(CommitMonitorError::MembershipMismatch { .. })
    ));
}

#[test]
fn commit_monitor_acknowledgements_test() {
    let mut membership = Membership::all_active(3);
    let sent_at = Instant::now();
    let mut monitor = CommitMonitor::new(
        Ticket::new(7),
        TimerHandle::new(0),
        PeerIndex::new(1),
        3,
        &membership,
        sent_at,
    )
    .unwrap();
    assert!(!monitor.is_fully_acknowledged());

    // The local peer is pre-acknowledged.
    assert_eq!(monitor.acknowledge(PeerIndex::new(1), &membership, sent_at), None);

    let rtt = monitor.acknowledge(PeerIndex::new(0), &membership, sent_at + Duration::from_millis(40));
    assert_eq!(rtt, Some(Duration::from_millis(40)));
    assert!(!monitor.is_fully_acknowledged());

    // Duplicate.
    assert_eq!(monitor.acknowledge(PeerIndex::new(0), &membership, sent_at), None);

    // Peer 2 leaves instead of answering.
    membership.remove(PeerIndex::new(2));
    monitor.refresh(&membership);
    assert!(monitor.is_fully_acknowledged());
}

#[test]
fn commit_monitor_single_peer_is_immediately_complete_test() {
    let membership = Membership::all_active(1);
    let monitor = CommitMonitor::new(
        Ticket::new(7),
        TimerHandle::new(0),
        PeerIndex::HOST,
        1,
        &membership,
        Instant::now(),
    )
    .unwrap();
    assert!(monitor.is_fully_acknowledged());
}
