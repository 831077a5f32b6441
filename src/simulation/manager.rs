/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round pipeline manager: the protocol state machine of the simulation stage.
//!
//! The [`SimulationManager`] is the only mutator of simulation-stage state. It is driven by
//! [`SessionEvent`]s dequeued one at a time by the simulation thread: frame alarms, commit and
//! acknowledgement timeouts, and frames received from peers.
//!
//! ## Lifecycle
//!
//! After [`reset`](SimulationManager::reset), the manager executes the frames of the *current* round on
//! a timer. When the last frame of the round has executed:
//! 1. If the *next* round is fully committed, the manager broadcasts its own commit for the *next-next*
//!    round, rotates the pipeline, and schedules the first frame of the new current round.
//! 2. Otherwise, the manager *waits*: no frame alarm is armed until the missing commits (or leave
//!    notices) arrive, at which point step 1 runs inline.
//!
//! Commands the local client issues while executing frame `f` of round `R` are addressed to frame slot `f`
//! of round `R + 2`. Every peer commits `R + 2` only after executing the last frame of `R`, so by the
//! time round `R + 2` is fully committed every peer has received every command addressed to it.
//!
//! The session ends with a [`Termination`]: the local client asked to stop, the host left, or a fatal
//! [`SimulationError`] occurred.
//!
//! ## Departures
//!
//! A guest that leaves (or disconnects) is registered against the earliest upcoming round it has not
//! committed yet. That counts as its commit, so a manager waiting for the guest resumes immediately.
//! The client is told about the departure when that round becomes current.
//!
//! When the host leaves, the manager stops listening to the network and drains the rounds that are
//! already fully committed, then terminates with [`Termination::HostLeft`].

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::Sender;
use std::time::{Instant, SystemTime};

use rand::Rng;

use crate::client::{ExecuteFrameResponse, SimulationClient};
use crate::config::Configuration;
use crate::events::*;
use crate::logging::first_seven_base64_chars;
use crate::messages::{Commit, Message, MessageDecodeError};
use crate::moving_average::MovingAverage;
use crate::networking::{network::Network, sending::SenderHandle};
use crate::session::SessionEvent;
use crate::timer::{TimerHandle, TimerKind, TimerService};
use crate::types::{
    data_types::{Command, FrameIndex, FrameTime, PeerIndex, RoundIndex, Ticket},
    membership::Membership,
};

use super::commit_monitor::{CommitMonitor, CommitMonitorError};
use super::pipeline::{RoundPipeline, Stage};
use super::round::PacingLimits;

/// How a simulation session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The local client asked to leave.
    Finished,

    /// The host left the session.
    HostLeft,

    /// A fatal simulation-stage error occurred. `reason` is the error's description, and `payload` is the
    /// opaque context attached by the peer that reported it, if any.
    Failed { reason: String, payload: Vec<u8> },
}

/// Every reason the simulation stage can fail. The session ends when any of these occurs.
#[derive(Debug)]
pub enum SimulationError {
    /// `peer` committed `round` with a state hash that differs from the other committers'.
    StateHashMismatch { round: RoundIndex, peer: PeerIndex },

    /// `round` was not fully committed within the commit timeout of it becoming the next round.
    CommitTimeout { round: RoundIndex },

    /// Some active peer did not acknowledge the commit with `ticket` within the commit answer timeout.
    CommitAnswerTimeout { ticket: Ticket },

    /// A frame received from `peer` could not be decoded.
    MalformedMessage { peer: PeerIndex, error: MessageDecodeError },

    /// `peer` sent a well-formed message that breaks the protocol.
    ProtocolViolation { peer: PeerIndex, violation: String },

    /// `peer` hit a fatal error and told everyone about it.
    PeerError { peer: PeerIndex, reason: String, payload: Vec<u8> },

    /// The membership the session was reset with does not fit the local peer.
    InvalidMembership(CommitMonitorError),
}

impl SimulationError {
    /// Whether the other peers should be sent a notice about this error. A peer's own error notice is not
    /// echoed back: it already notified everyone.
    fn should_notify_peers(&self) -> bool {
        !matches!(self, SimulationError::PeerError { .. })
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            SimulationError::PeerError { payload, .. } => payload.clone(),
            _ => Vec::new(),
        }
    }
}

impl Display for SimulationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::StateHashMismatch { round, peer } => {
                write!(f, "state hash of peer {} diverged in round {}", peer, round)
            }
            SimulationError::CommitTimeout { round } => {
                write!(f, "round {} was not committed in time", round)
            }
            SimulationError::CommitAnswerTimeout { ticket } => {
                write!(f, "commit {} was not acknowledged in time", ticket)
            }
            SimulationError::MalformedMessage { peer, error } => {
                write!(f, "peer {} sent a {}", peer, error)
            }
            SimulationError::ProtocolViolation { peer, violation } => {
                write!(f, "peer {} violated the protocol: {}", peer, violation)
            }
            SimulationError::PeerError { peer, reason, .. } => {
                write!(f, "peer {} failed: {}", peer, reason)
            }
            SimulationError::InvalidMembership(error) => write!(f, "invalid membership: {}", error),
        }
    }
}

impl From<CommitMonitorError> for SimulationError {
    fn from(error: CommitMonitorError) -> Self {
        SimulationError::InvalidMembership(error)
    }
}

pub struct SimulationManager<C: SimulationClient, N: Network, T: TimerService> {
    config: Configuration,
    pacing_limits: PacingLimits,
    client: C,
    sender: SenderHandle<N>,
    timers: T,
    membership: Membership,
    pipeline: RoundPipeline,
    monitors: HashMap<Ticket, CommitMonitor>,
    frame_times: MovingAverage,
    ping_times: Vec<MovingAverage>,
    frame_timer: Option<TimerHandle>,
    commit_timeout: Option<(RoundIndex, TimerHandle)>,
    // When the current round's first frame was due.
    round_base: Instant,
    waiting_since: Option<Instant>,
    started: bool,
    host_left: bool,
    // Set once termination is underway; suppresses further fatal errors.
    disposed: bool,
    termination: Option<Termination>,
    event_publisher: Option<Sender<Event>>,
}

impl<C: SimulationClient, N: Network, T: TimerService> SimulationManager<C, N, T> {
    /// Create a manager. Nothing happens until [`reset`](Self::reset) is called.
    pub fn new(
        config: Configuration,
        client: C,
        network: N,
        timers: T,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let frame_times = MovingAverage::new(config.average_window, config.frame_time_seed.as_millis() as u64);
        let round_base = timers.now();
        Self {
            pacing_limits: config.pacing_limits(),
            pipeline: RoundPipeline::new(0, config.max_frames_per_round),
            config,
            client,
            sender: SenderHandle::new(network),
            timers,
            membership: Membership::new(Vec::new()),
            monitors: HashMap::new(),
            frame_times,
            ping_times: Vec::new(),
            frame_timer: None,
            commit_timeout: None,
            round_base,
            waiting_since: None,
            started: false,
            host_left: false,
            disposed: false,
            termination: None,
            event_publisher,
        }
    }

    /// (Re)start the simulation stage with the given membership.
    ///
    /// Rebuilds the pipeline with round 0 pre-committed, broadcasts the local commit for round 1, and
    /// schedules the first frame of round 0 to execute immediately.
    pub fn reset(&mut self, membership: Membership) -> Result<(), SimulationError> {
        self.release_timers_and_monitors();

        let peer_count = membership.len();
        self.membership = membership;
        self.pipeline = RoundPipeline::new(peer_count, self.config.max_frames_per_round);
        self.pipeline.reset(&self.membership);

        let window = self.config.average_window;
        self.frame_times = MovingAverage::new(window, self.config.frame_time_seed.as_millis() as u64);
        let ping_seed = self.config.ping_time_seed.as_millis() as u64;
        self.ping_times = (0..peer_count).map(|_| MovingAverage::new(window, ping_seed)).collect();

        self.waiting_since = None;
        self.host_left = false;
        self.disposed = false;
        self.termination = None;
        self.started = true;

        self.start_current_round();
        self.broadcast_commit(Stage::Next)?;
        self.arm_commit_timeout();

        let now = self.timers.now();
        self.round_base = now;
        self.schedule_next_frame(now);
        Ok(())
    }

    /// Arm the frame alarm for `at`, replacing any previously armed one.
    pub fn schedule_next_frame(&mut self, at: Instant) {
        if let Some(previous) = self.frame_timer.take() {
            self.timers.cancel(previous);
        }
        self.frame_timer = Some(self.timers.set_alarm(at, TimerKind::ExecuteFrame));
    }

    /// Execute the frame the current round's cursor is on, then schedule the next one, move on to the next
    /// round, or start waiting for it.
    pub fn execute_next_frame(&mut self) -> Result<(), SimulationError> {
        self.frame_timer = None;

        let pacing = self
            .pipeline
            .current_mut()
            .compute_pacing(&self.membership, &self.pacing_limits);
        let frame = self.pipeline.current().frame();
        // Computed before doing any work so that lateness does not accumulate across frames.
        let ideal_next = self.round_base + pacing.target_frame_time * (frame.int() + 1);

        self.deliver_commands();

        let started_at = self.timers.now();
        let response = self.client.execute_frame();
        let elapsed = self.timers.now().saturating_duration_since(started_at);
        self.frame_times.record(elapsed.as_millis() as u64);

        match response {
            ExecuteFrameResponse::Stop { reason, custom } => {
                log::debug!("Local client stopped in frame {} of round {}: {}", frame, self.pipeline.current().index(), reason);
                self.sender.broadcast(Message::leave(reason, custom));
                self.terminate(Termination::Finished);
                return Ok(());
            }
            ExecuteFrameResponse::Continue { commands } => {
                if !commands.is_empty() {
                    self.distribute_commands(commands, frame)?;
                }
            }
        }

        if self.pipeline.current_mut().advance_frame() {
            self.schedule_next_frame(ideal_next);
            return Ok(());
        }

        self.end_round(ideal_next)
    }

    /// Advance the pipeline by one round and start executing the new current round.
    ///
    /// # Panics
    ///
    /// Panics if the next round is not fully committed.
    pub fn rotate_pipeline(&mut self) {
        if let Some((round, handle)) = self.commit_timeout.take() {
            log::trace!("Cancelling commit timeout of round {}", round);
            self.timers.cancel(handle);
        }
        self.pipeline.rotate(&self.membership);
        self.start_current_round();

        let leaving: Vec<PeerIndex> = self.pipeline.current().leaving_peers().collect();
        for peer in leaving {
            self.client.on_peer_left(peer);
        }

        self.arm_commit_timeout();
    }

    /// Register `origin`'s commit, and answer it with an acknowledgement.
    pub fn register_commit(&mut self, origin: PeerIndex, commit: Commit) -> Result<(), SimulationError> {
        Event::publish(
            &self.event_publisher,
            Event::ReceiveCommit(ReceiveCommitEvent {
                timestamp: SystemTime::now(),
                origin,
                commit: commit.clone(),
            }),
        );
        self.sender.send(origin, Message::commit_ack(commit.ticket));

        let stage = match self.pipeline.stage_of(commit.round) {
            Some(stage @ (Stage::Next | Stage::NextNext)) => stage,
            _ => {
                log::warn!(
                    "Ignoring commit from peer {} for round {}, outside of the pipeline {:?}",
                    origin,
                    commit.round,
                    self.pipeline.indices()
                );
                return Ok(());
            }
        };

        let round = self.pipeline.get_mut(stage);
        if round.has_committed(origin) {
            return Err(SimulationError::ProtocolViolation {
                peer: origin,
                violation: format!("committed round {} twice", commit.round),
            });
        }
        if !round.commit(origin, commit.aft, commit.apt, commit.state_hash) {
            return Err(SimulationError::StateHashMismatch {
                round: commit.round,
                peer: origin,
            });
        }
        log::trace!("Peer {} committed round {}", origin, commit.round);

        if stage == Stage::Next {
            self.on_next_round_progress()?;
        }
        Ok(())
    }

    /// Buffer the commands `origin` addressed to `frame` of `round`.
    pub fn register_commands(
        &mut self,
        commands: Vec<Command>,
        round: RoundIndex,
        frame: FrameIndex,
        origin: PeerIndex,
    ) -> Result<(), SimulationError> {
        let stage = match self.pipeline.stage_of(round) {
            Some(stage @ (Stage::Next | Stage::NextNext | Stage::NextNextNext)) => stage,
            _ => {
                return Err(SimulationError::ProtocolViolation {
                    peer: origin,
                    violation: format!("sent commands for round {}, outside of the pipeline", round),
                })
            }
        };

        let target = self.pipeline.get_mut(stage);
        if frame.as_slot() >= target.max_frames() {
            return Err(SimulationError::ProtocolViolation {
                peer: origin,
                violation: format!("sent commands for frame {} of round {}", frame, round),
            });
        }
        if !target.submit_commands(commands, origin, frame) {
            return Err(SimulationError::ProtocolViolation {
                peer: origin,
                violation: format!("sent rejected commands for frame {} of round {}", frame, round),
            });
        }
        Ok(())
    }

    /// Register `origin`'s acknowledgement of the local commit with `ticket`.
    ///
    /// A monitor lives until every active peer has acknowledged it, so an acknowledgement for a ticket
    /// that is not live, or a second one from the same peer, is a protocol violation.
    pub fn register_commit_acknowledgement(
        &mut self,
        origin: PeerIndex,
        ticket: Ticket,
    ) -> Result<(), SimulationError> {
        let now = self.timers.now();
        let monitor = match self.monitors.get_mut(&ticket) {
            Some(monitor) => monitor,
            None => {
                return Err(SimulationError::ProtocolViolation {
                    peer: origin,
                    violation: format!("acknowledged unknown commit {}", ticket),
                })
            }
        };
        let round_trip = match monitor.acknowledge(origin, &self.membership, now) {
            Some(round_trip) => round_trip,
            None => {
                return Err(SimulationError::ProtocolViolation {
                    peer: origin,
                    violation: format!("acknowledged commit {} twice", ticket),
                })
            }
        };
        let fully_acknowledged = monitor.is_fully_acknowledged();

        if let Some(ping_times) = self.ping_times.get_mut(origin.int()) {
            ping_times.record(round_trip.as_millis() as u64);
        }
        Event::publish(
            &self.event_publisher,
            Event::ReceiveCommitAck(ReceiveCommitAckEvent {
                timestamp: SystemTime::now(),
                origin,
                ticket,
                round_trip,
            }),
        );

        if fully_acknowledged {
            self.unregister_monitor(ticket);
        }
        Ok(())
    }

    /// Register that `origin` left the session.
    pub fn register_leave(&mut self, origin: PeerIndex, reason: String) -> Result<(), SimulationError> {
        if origin == self.config.me || !self.membership.is_active(origin) {
            log::debug!("Ignoring departure of inactive peer {}", origin);
            return Ok(());
        }
        self.membership.remove(origin);

        if origin.is_host() {
            return self.register_host_leave(reason);
        }

        let round = self.pipeline.leave(origin);
        log::debug!("Peer {} left during round {:?}: {}", origin, round, reason);
        Event::publish(
            &self.event_publisher,
            Event::PeerLeft(PeerLeftEvent {
                timestamp: SystemTime::now(),
                peer: origin,
                round,
                reason,
            }),
        );
        if round.is_none() {
            self.client.on_peer_left(origin);
        }

        self.refresh_monitors();
        self.on_next_round_progress()
    }

    /// The single exit path for fatal errors: release every timer and monitor, notify the other peers and
    /// the client, then terminate.
    pub fn simulation_stage_error(&mut self, error: SimulationError) {
        if self.disposed {
            log::debug!("Suppressing simulation error during termination: {}", error);
            return;
        }
        self.disposed = true;
        self.release_timers_and_monitors();

        let reason = error.to_string();
        let payload = error.payload();
        if error.should_notify_peers() {
            self.sender.broadcast(Message::simulation_error(reason.clone(), Vec::new()));
        }
        Event::publish(
            &self.event_publisher,
            Event::SimulationError(SimulationErrorEvent {
                timestamp: SystemTime::now(),
                reason: reason.clone(),
            }),
        );
        self.client.on_simulation_error(&reason, &payload);
        self.terminate(Termination::Failed { reason, payload });
    }

    /// Dispatch one event from the queue to completion. Events that arrive after termination are dropped.
    pub fn handle_event(&mut self, event: SessionEvent) {
        if !self.started || self.termination.is_some() {
            return;
        }
        let result = match event {
            SessionEvent::Message { origin, frame } => self.on_receive_frame(origin, &frame),
            SessionEvent::Disconnected(peer) => {
                if self.host_left {
                    Ok(())
                } else {
                    self.register_leave(peer, String::from("disconnected"))
                }
            }
            SessionEvent::Timer { handle, kind } => self.on_timer(handle, kind),
            // Handled by the session driver.
            SessionEvent::Shutdown => Ok(()),
        };
        if let Err(error) = result {
            self.simulation_stage_error(error);
        }
    }

    pub fn pipeline(&self) -> &RoundPipeline {
        &self.pipeline
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_since.is_some()
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn on_receive_frame(&mut self, origin: PeerIndex, frame: &[u8]) -> Result<(), SimulationError> {
        if self.host_left {
            log::trace!("Host left, ignoring frame from peer {}", origin);
            return Ok(());
        }
        if origin == self.config.me || !self.membership.contains(origin) {
            log::warn!("Ignoring frame from unknown peer {}", origin);
            return Ok(());
        }
        if !self.membership.is_active(origin) {
            log::debug!("Ignoring frame from departed peer {}", origin);
            return Ok(());
        }

        let message = Message::decode(frame)
            .map_err(|error| SimulationError::MalformedMessage { peer: origin, error })?;
        log::trace!("Received {} from peer {}", message.kind(), origin);
        match message {
            Message::Commit(commit) => self.register_commit(origin, commit),
            Message::CommitAck(ack) => self.register_commit_acknowledgement(origin, ack.ticket),
            Message::CommandBatch(batch) => self.register_commands(batch.commands, batch.round, batch.frame, origin),
            Message::Leave(leave) => self.register_leave(origin, leave.reason),
            Message::SimulationError(notice) => Err(SimulationError::PeerError {
                peer: origin,
                reason: notice.reason,
                payload: notice.custom,
            }),
        }
    }

    // Alarms are re-validated: one may fire after it was cancelled if its event was already queued.
    fn on_timer(&mut self, handle: TimerHandle, kind: TimerKind) -> Result<(), SimulationError> {
        match kind {
            TimerKind::ExecuteFrame => {
                if self.frame_timer != Some(handle) {
                    log::trace!("Ignoring stale frame alarm {:?}", handle);
                    return Ok(());
                }
                self.execute_next_frame()
            }
            TimerKind::CommitTimeout(round) => {
                let next = self.pipeline.next();
                if self.commit_timeout != Some((round, handle))
                    || next.index() != round
                    || next.is_committed(&self.membership)
                {
                    log::trace!("Ignoring stale commit timeout of round {}", round);
                    return Ok(());
                }
                Err(SimulationError::CommitTimeout { round })
            }
            TimerKind::CommitAnswerTimeout(ticket) => {
                match self.monitors.get(&ticket) {
                    Some(monitor) if monitor.timeout() == handle => {
                        Err(SimulationError::CommitAnswerTimeout { ticket })
                    }
                    _ => {
                        log::trace!("Ignoring stale answer timeout of commit {}", ticket);
                        Ok(())
                    }
                }
            }
        }
    }

    fn register_host_leave(&mut self, reason: String) -> Result<(), SimulationError> {
        log::debug!("Host left: {}", reason);
        self.host_left = true;
        // Nothing the remaining peers do can be fatal from here on.
        self.disposed = true;
        self.release_timers_and_monitors_except_frame();
        Event::publish(
            &self.event_publisher,
            Event::HostLeft(HostLeftEvent {
                timestamp: SystemTime::now(),
                reason,
            }),
        );

        if self.is_waiting() && self.pipeline.next().is_committed(&self.membership) {
            return self.resume_from_wait();
        }
        self.host_departed();
        Ok(())
    }

    // Called whenever the next round may have become fully committed.
    fn on_next_round_progress(&mut self) -> Result<(), SimulationError> {
        let next = self.pipeline.next();
        if !next.is_committed(&self.membership) {
            return Ok(());
        }
        if let Some((round, handle)) = self.commit_timeout {
            if round == next.index() {
                self.timers.cancel(handle);
                self.commit_timeout = None;
            }
        }
        if self.is_waiting() {
            self.resume_from_wait()?;
        }
        Ok(())
    }

    fn end_round(&mut self, ideal_next: Instant) -> Result<(), SimulationError> {
        if self.pipeline.next().is_committed(&self.membership) {
            return self.advance_round(ideal_next);
        }
        if self.host_left {
            self.host_departed();
            return Ok(());
        }

        let round = self.pipeline.next().index();
        log::debug!("Waiting for round {} to be committed", round);
        self.waiting_since = Some(self.timers.now());
        Event::publish(
            &self.event_publisher,
            Event::WaitForCommit(WaitForCommitEvent {
                timestamp: SystemTime::now(),
                round,
            }),
        );
        Ok(())
    }

    fn resume_from_wait(&mut self) -> Result<(), SimulationError> {
        let now = self.timers.now();
        let waited = self
            .waiting_since
            .take()
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        Event::publish(
            &self.event_publisher,
            Event::ResumeFromWait(ResumeFromWaitEvent {
                timestamp: SystemTime::now(),
                round: self.pipeline.next().index(),
                waited,
            }),
        );
        self.advance_round(now)
    }

    fn advance_round(&mut self, base: Instant) -> Result<(), SimulationError> {
        // Without the host no new round can be committed, only the committed ones are drained.
        if !self.host_left {
            self.broadcast_commit(Stage::NextNext)?;
        }
        self.rotate_pipeline();
        self.round_base = base;
        self.schedule_next_frame(base);
        Ok(())
    }

    fn start_current_round(&mut self) {
        let current = self.pipeline.current_mut();
        let pacing = current.compute_pacing(&self.membership, &self.pacing_limits);
        let round = current.index();
        log::debug!(
            "Starting round {}: {} frames of {}ms",
            round,
            pacing.frame_count,
            pacing.target_frame_time.as_millis()
        );
        Event::publish(
            &self.event_publisher,
            Event::StartRound(StartRoundEvent {
                timestamp: SystemTime::now(),
                round,
                pacing,
            }),
        );
    }

    // Broadcast the local commit for the round at `stage`, and commit it locally.
    fn broadcast_commit(&mut self, stage: Stage) -> Result<(), SimulationError> {
        let me = self.config.me;
        let round = self.pipeline.get(stage).index();
        let aft = FrameTime::from_millis(self.frame_times.average());
        let apt = FrameTime::from_millis(self.highest_ping_time());
        let state_hash = self.client.state_hash();
        let ticket = self.fresh_ticket();

        let now = self.timers.now();
        let timeout = self
            .timers
            .set_alarm(now + self.config.commit_answer_timeout, TimerKind::CommitAnswerTimeout(ticket));
        let monitor = match CommitMonitor::new(ticket, timeout, me, self.membership.len(), &self.membership, now) {
            Ok(monitor) => monitor,
            Err(error) => {
                self.timers.cancel(timeout);
                return Err(error.into());
            }
        };
        if monitor.is_fully_acknowledged() {
            self.timers.cancel(timeout);
        } else {
            self.monitors.insert(ticket, monitor);
        }

        log::trace!(
            "Committing round {} with ticket {} and state hash {}",
            round,
            ticket,
            first_seven_base64_chars(state_hash.bytes())
        );
        self.sender
            .broadcast(Message::commit(aft, apt, round, ticket, state_hash.clone()));
        Event::publish(
            &self.event_publisher,
            Event::Commit(CommitEvent {
                timestamp: SystemTime::now(),
                round,
                ticket,
                aft,
                apt,
                state_hash: state_hash.clone(),
            }),
        );

        if !self.pipeline.get_mut(stage).commit(me, aft, apt, state_hash) {
            return Err(SimulationError::StateHashMismatch { round, peer: me });
        }
        Ok(())
    }

    // Buffer the local client's commands two rounds ahead and send them to everyone.
    fn distribute_commands(&mut self, commands: Vec<Command>, frame: FrameIndex) -> Result<(), SimulationError> {
        let me = self.config.me;
        let target = self.pipeline.get_mut(Stage::NextNext);
        let round = target.index();
        if !target.submit_commands(commands.clone(), me, frame) {
            return Err(SimulationError::ProtocolViolation {
                peer: me,
                violation: format!("local client issued rejected commands in frame {}", frame),
            });
        }
        self.sender.broadcast(Message::command_batch(round, frame, commands));
        Ok(())
    }

    // Deliver the current frame's commands: the host's first, then the guests' in slot order.
    fn deliver_commands(&mut self) {
        for peer in self.membership.peers() {
            let commands = match self.pipeline.current_mut().commands_for(peer) {
                Some(commands) => commands,
                None => continue,
            };
            for command in commands {
                if peer.is_host() {
                    self.client.deliver_host_command(command);
                } else {
                    self.client.deliver_guest_command(peer, command);
                }
            }
        }
    }

    fn arm_commit_timeout(&mut self) {
        if let Some((_, handle)) = self.commit_timeout.take() {
            self.timers.cancel(handle);
        }
        if self.disposed {
            return;
        }
        let next = self.pipeline.next();
        if next.is_committed(&self.membership) {
            return;
        }
        let round = next.index();
        let at = self.timers.now() + self.config.commit_timeout;
        let handle = self.timers.set_alarm(at, TimerKind::CommitTimeout(round));
        self.commit_timeout = Some((round, handle));
    }

    fn highest_ping_time(&self) -> u64 {
        self.membership
            .active_peers()
            .filter(|peer| *peer != self.config.me)
            .filter_map(|peer| self.ping_times.get(peer.int()))
            .map(MovingAverage::average)
            .max()
            .unwrap_or(0)
    }

    fn fresh_ticket(&self) -> Ticket {
        let mut rng = rand::thread_rng();
        loop {
            let ticket = Ticket::new(rng.gen::<u32>());
            if !self.monitors.contains_key(&ticket) {
                return ticket;
            }
        }
    }

    // A departure can make pending acknowledgements moot.
    fn refresh_monitors(&mut self) {
        let mut completed = Vec::new();
        for (ticket, monitor) in self.monitors.iter_mut() {
            monitor.refresh(&self.membership);
            if monitor.is_fully_acknowledged() {
                completed.push(*ticket);
            }
        }
        for ticket in completed {
            self.unregister_monitor(ticket);
        }
    }

    fn unregister_monitor(&mut self, ticket: Ticket) {
        if let Some(monitor) = self.monitors.remove(&ticket) {
            self.timers.cancel(monitor.timeout());
        }
    }

    fn release_timers_and_monitors(&mut self) {
        if let Some(handle) = self.frame_timer.take() {
            self.timers.cancel(handle);
        }
        self.release_timers_and_monitors_except_frame();
    }

    fn release_timers_and_monitors_except_frame(&mut self) {
        if let Some((_, handle)) = self.commit_timeout.take() {
            self.timers.cancel(handle);
        }
        for (_, monitor) in self.monitors.drain() {
            self.timers.cancel(monitor.timeout());
        }
    }

    fn host_departed(&mut self) {
        self.client.on_host_left();
        self.terminate(Termination::HostLeft);
    }

    fn terminate(&mut self, termination: Termination) {
        self.disposed = true;
        self.release_timers_and_monitors();
        self.waiting_since = None;
        log::debug!("Simulation stage terminated: {:?}", termination);
        Event::publish(
            &self.event_publisher,
            Event::Terminate(TerminateEvent {
                timestamp: SystemTime::now(),
                termination: termination.clone(),
            }),
        );
        self.termination = Some(termination);
    }
}
