//! Tests for the round pipeline manager, driven one event at a time.
//!
//! The manager under test runs on a [ManualTimer], whose clock only moves when an alarm is fired, and a
//! [RecordingNetwork], which records every message the manager sends. The remote peers are played by the
//! tests themselves, by handing the manager encoded frames.

mod common;

use std::sync::mpsc;
use std::time::Duration;

use log::LevelFilter;
use lockstep_rs::{
    client::ExecuteFrameResponse,
    events::Event,
    messages::{Commit, Message},
    session::SessionEvent,
    simulation::{
        manager::{SimulationManager, Termination},
        round::RoundPacing,
    },
    timer::{TimerHandle, TimerKind},
    types::{
        data_types::{Command, FrameIndex, FrameTime, PeerIndex, RoundIndex, StateHash, Ticket},
        membership::Membership,
    },
};

use common::{
    client::RecordingClient,
    configuration::manager_configuration,
    logging::setup_logger,
    network::{Recipients, RecordingNetwork},
    timer::ManualTimer,
};

type TestManager = SimulationManager<RecordingClient, RecordingNetwork, ManualTimer>;

const GUEST: PeerIndex = PeerIndex::new(1);

fn start_manager(me: PeerIndex, peer_count: usize, client: RecordingClient) -> (TestManager, RecordingNetwork, ManualTimer) {
    setup_logger(LevelFilter::Debug);
    let network = RecordingNetwork::new();
    let timer = ManualTimer::new();
    let mut manager = SimulationManager::new(
        manager_configuration(me.int()),
        client,
        network.clone(),
        timer.clone(),
        None,
    );
    manager.reset(Membership::all_active(peer_count)).unwrap();
    (manager, network, timer)
}

fn receive(manager: &mut TestManager, origin: PeerIndex, message: Message) {
    manager.handle_event(SessionEvent::Message {
        origin,
        frame: message.encode(),
    });
}

fn fire_next_frame(manager: &mut TestManager, timer: &ManualTimer) {
    let event = timer.fire_next_frame().expect("a frame alarm should be armed");
    manager.handle_event(event);
}

fn broadcast_commit(sent: &[(Recipients, Message)], round: u32) -> Option<Commit> {
    sent.iter().find_map(|(recipients, message)| match message {
        Message::Commit(commit) if *recipients == Recipients::Everyone && commit.round == RoundIndex::new(round) => {
            Some(commit.clone())
        }
        _ => None,
    })
}

fn remote_commit(round: u32, ticket: u32, apt: u16, state_hash: StateHash) -> Message {
    Message::commit(
        FrameTime::new(50),
        FrameTime::new(apt),
        RoundIndex::new(round),
        Ticket::new(ticket),
        state_hash,
    )
}

fn failure_reason(manager: &TestManager) -> String {
    match manager.termination() {
        Some(Termination::Failed { reason, .. }) => reason.clone(),
        other => panic!("expected a failed session, got {:?}", other),
    }
}

#[test]
fn reset_broadcasts_first_commit_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (manager, network, timer) = start_manager(PeerIndex::HOST, 2, client);

    let sent = network.take_sent();
    let commit = broadcast_commit(&sent, 1).unwrap();
    // Moving averages start at their seeds.
    assert_eq!(commit.aft, FrameTime::new(50));
    assert_eq!(commit.apt, FrameTime::new(100));

    assert_eq!(
        manager.pipeline().indices(),
        [0, 1, 2, 3].map(RoundIndex::new)
    );
    assert!(manager.pipeline().current().is_committed(manager.membership()));
    assert!(manager.pipeline().next().has_committed(PeerIndex::HOST));
    assert!(!manager.pipeline().next().is_committed(manager.membership()));

    let armed = timer.armed();
    assert!(armed.contains(&TimerKind::ExecuteFrame));
    assert!(armed.contains(&TimerKind::CommitTimeout(RoundIndex::new(1))));
    assert!(armed.contains(&TimerKind::CommitAnswerTimeout(commit.ticket)));
}

#[test]
fn two_peer_session_commits_and_rotates_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    let own_commit = broadcast_commit(&network.take_sent(), 1).unwrap();

    // The guest commits round 1 with the same state hash.
    receive(&mut manager, GUEST, remote_commit(1, 77, 120, own_commit.state_hash.clone()));
    assert!(manager.pipeline().next().is_committed(manager.membership()));
    assert!(!timer.armed().contains(&TimerKind::CommitTimeout(RoundIndex::new(1))));
    let sent = network.take_sent();
    assert!(sent.contains(&(Recipients::Peers(vec![GUEST]), Message::commit_ack(Ticket::new(77)))));

    // The guest acknowledges the local commit 30ms after it was sent.
    timer.advance(Duration::from_millis(30));
    receive(&mut manager, GUEST, Message::commit_ack(own_commit.ticket));
    assert!(!timer.armed().contains(&TimerKind::CommitAnswerTimeout(own_commit.ticket)));

    // Round 0 has a single frame, after which the manager moves on to round 1.
    fire_next_frame(&mut manager, &timer);
    assert_eq!(client.log().frames.len(), 1);
    assert!(!manager.is_waiting());
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(1));

    // Highest AFT 50ms, highest APT 120ms: 120 / 50 + 1 frames of 50ms.
    assert_eq!(
        manager.pipeline().current().pacing(),
        Some(RoundPacing {
            target_frame_time: Duration::from_millis(50),
            frame_count: 3,
        })
    );

    // The commit for round 2 reports the updated averages: one 0ms frame against three 50ms seeds, and
    // one 30ms ping against three 100ms seeds.
    let commit = broadcast_commit(&network.take_sent(), 2).unwrap();
    assert_eq!(commit.aft, FrameTime::new(37));
    assert_eq!(commit.apt, FrameTime::new(82));
    assert!(manager.pipeline().next().has_committed(PeerIndex::HOST));
}

#[test]
fn events_are_published_test() {
    let (event_publisher, event_subscriber) = mpsc::channel();
    let mut manager = SimulationManager::new(
        manager_configuration(0),
        RecordingClient::idle(PeerIndex::HOST),
        RecordingNetwork::new(),
        ManualTimer::new(),
        Some(event_publisher),
    );
    manager.reset(Membership::all_active(2)).unwrap();

    let events: Vec<Event> = event_subscriber.try_iter().collect();
    assert!(events.iter().any(|event| matches!(
        event,
        Event::StartRound(start_round) if start_round.round == RoundIndex::new(0)
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Commit(commit) if commit.round == RoundIndex::new(1)
    )));
}

#[test]
fn departure_unblocks_waiting_manager_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    let state_hash = broadcast_commit(&network.take_sent(), 1).unwrap().state_hash;

    // Round 0 ends before the guest commits round 1.
    fire_next_frame(&mut manager, &timer);
    assert!(manager.is_waiting());
    assert!(timer.fire_next_frame().is_none());

    // The guest's commit resumes execution inline.
    receive(&mut manager, GUEST, remote_commit(1, 5, 100, state_hash));
    assert!(!manager.is_waiting());
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(1));

    // Round 1 has 100 / 50 + 1 frames, after which the manager waits for the guest's commit of round 2.
    for _ in 0..3 {
        fire_next_frame(&mut manager, &timer);
    }
    assert!(manager.is_waiting());
    assert_eq!(manager.pipeline().next().index(), RoundIndex::new(2));
    assert!(!manager.pipeline().next().has_committed(GUEST));

    // The guest leaves instead, which commits round 2 on its behalf.
    receive(&mut manager, GUEST, Message::leave(String::from("bye"), Vec::new()));
    assert!(!manager.is_waiting());
    assert_eq!(manager.termination(), None);
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(2));
    assert!(!manager.membership().is_active(GUEST));
    assert_eq!(client.log().peers_left, vec![GUEST]);

    // Pending acknowledgements from the guest became moot.
    assert!(!timer
        .armed()
        .iter()
        .any(|kind| matches!(kind, TimerKind::CommitAnswerTimeout(_))));

    // The host goes on alone.
    fire_next_frame(&mut manager, &timer);
    assert_eq!(manager.termination(), None);
}

#[test]
fn disconnect_is_treated_as_leave_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, _network, timer) = start_manager(PeerIndex::HOST, 3, client.clone());

    fire_next_frame(&mut manager, &timer);
    assert!(manager.is_waiting());

    manager.handle_event(SessionEvent::Disconnected(PeerIndex::new(2)));
    assert!(manager.is_waiting());
    manager.handle_event(SessionEvent::Disconnected(GUEST));
    assert!(!manager.is_waiting());
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(1));
    assert_eq!(client.log().peers_left, vec![GUEST, PeerIndex::new(2)]);
}

#[test]
fn commands_are_delivered_two_rounds_later_test() {
    let client = RecordingClient::busy(PeerIndex::HOST, None);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    let state_hash = broadcast_commit(&network.take_sent(), 1).unwrap().state_hash;
    receive(&mut manager, GUEST, remote_commit(1, 5, 100, state_hash));

    // The host's command from frame 0 of round 0 is addressed to frame 0 of round 2.
    fire_next_frame(&mut manager, &timer);
    let sent = network.take_sent();
    let host_command = Command::new(vec![0, 1]);
    assert!(sent.contains(&(
        Recipients::Everyone,
        Message::command_batch(RoundIndex::new(2), FrameIndex::new(0), vec![host_command.clone()])
    )));

    // The guest does the same, then commits round 2 with the state hash after round 0.
    let guest_command = Command::new(vec![1, 1]);
    receive(
        &mut manager,
        GUEST,
        Message::command_batch(RoundIndex::new(2), FrameIndex::new(0), vec![guest_command.clone()]),
    );
    let state_hash = broadcast_commit(&sent, 2).unwrap().state_hash;
    receive(&mut manager, GUEST, remote_commit(2, 6, 100, state_hash));

    // Three frames of round 1, then the first frame of round 2.
    for _ in 0..4 {
        fire_next_frame(&mut manager, &timer);
    }
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(2));
    let log = client.log();
    assert_eq!(log.frames.len(), 5);
    assert!(log.frames[..4].iter().all(|delivered| delivered.is_empty()));
    assert_eq!(
        log.frames[4],
        vec![(PeerIndex::HOST, host_command), (GUEST, guest_command)]
    );
}

#[test]
fn commands_outside_pipeline_are_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, _network, _timer) = start_manager(PeerIndex::HOST, 2, client);

    let command = Command::new(vec![1]);
    receive(
        &mut manager,
        GUEST,
        Message::command_batch(RoundIndex::new(3), FrameIndex::new(7), vec![command.clone()]),
    );
    assert_eq!(manager.termination(), None);

    receive(
        &mut manager,
        GUEST,
        Message::command_batch(RoundIndex::new(9), FrameIndex::new(0), vec![command]),
    );
    assert!(failure_reason(&manager).contains("outside of the pipeline"));
}

#[test]
fn state_hash_mismatch_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    network.take_sent();

    receive(&mut manager, GUEST, remote_commit(1, 5, 100, StateHash::new(vec![1, 2, 3])));

    let reason = failure_reason(&manager);
    assert!(reason.contains("diverged"));
    assert_eq!(client.log().errors, vec![(reason.clone(), Vec::new())]);
    assert!(network
        .take_sent()
        .contains(&(Recipients::Everyone, Message::simulation_error(reason, Vec::new()))));
    assert!(timer.armed().is_empty());

    // Nothing happens after termination.
    manager.handle_event(SessionEvent::Disconnected(GUEST));
    assert_eq!(client.log().errors.len(), 1);
}

#[test]
fn duplicate_commit_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, _timer) = start_manager(PeerIndex::HOST, 3, client);
    let state_hash = broadcast_commit(&network.take_sent(), 1).unwrap().state_hash;

    receive(&mut manager, GUEST, remote_commit(1, 5, 100, state_hash.clone()));
    assert_eq!(manager.termination(), None);
    receive(&mut manager, GUEST, remote_commit(1, 6, 100, state_hash));
    assert!(failure_reason(&manager).contains("twice"));
}

#[test]
fn commit_outside_pipeline_is_acknowledged_and_ignored_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, _timer) = start_manager(PeerIndex::HOST, 2, client);
    network.take_sent();

    receive(&mut manager, GUEST, remote_commit(3, 5, 100, StateHash::new(vec![1])));
    assert_eq!(manager.termination(), None);
    assert_eq!(
        network.take_sent(),
        vec![(Recipients::Peers(vec![GUEST]), Message::commit_ack(Ticket::new(5)))]
    );
}

#[test]
fn duplicate_acknowledgement_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 3, client.clone());
    let own_commit = broadcast_commit(&network.take_sent(), 1).unwrap();

    // The commit still awaits peer 2, so its monitor stays live after the guest's first answer.
    receive(&mut manager, GUEST, Message::commit_ack(own_commit.ticket));
    assert_eq!(manager.termination(), None);
    assert!(timer.armed().contains(&TimerKind::CommitAnswerTimeout(own_commit.ticket)));

    receive(&mut manager, GUEST, Message::commit_ack(own_commit.ticket));
    let reason = failure_reason(&manager);
    assert!(reason.contains("twice"));
    assert_eq!(client.log().errors.len(), 1);
    assert!(network
        .take_sent()
        .contains(&(Recipients::Everyone, Message::simulation_error(reason, Vec::new()))));
}

#[test]
fn acknowledgement_of_unknown_commit_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, _timer) = start_manager(PeerIndex::HOST, 2, client);
    let own_commit = broadcast_commit(&network.take_sent(), 1).unwrap();

    // Fully acknowledged commits are forgotten, so answering again names an unknown ticket.
    receive(&mut manager, GUEST, Message::commit_ack(own_commit.ticket));
    assert_eq!(manager.termination(), None);
    receive(&mut manager, GUEST, Message::commit_ack(own_commit.ticket));
    assert!(failure_reason(&manager).contains("unknown commit"));
}

#[test]
fn acknowledgement_of_never_sent_commit_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, _timer) = start_manager(PeerIndex::HOST, 2, client);
    let own_commit = broadcast_commit(&network.take_sent(), 1).unwrap();

    let bogus = Ticket::new(own_commit.ticket.int().wrapping_add(1));
    receive(&mut manager, GUEST, Message::commit_ack(bogus));
    assert!(failure_reason(&manager).contains("unknown commit"));
}

#[test]
fn malformed_frame_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, _network, _timer) = start_manager(PeerIndex::HOST, 2, client);

    manager.handle_event(SessionEvent::Message {
        origin: GUEST,
        frame: vec![0xff, 0x00],
    });
    assert!(failure_reason(&manager).contains("malformed"));
}

#[test]
fn commit_timeout_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, _network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());

    let event = timer
        .fire_next(|kind| matches!(kind, TimerKind::CommitTimeout(_)))
        .unwrap();
    manager.handle_event(event);
    assert!(failure_reason(&manager).contains("not committed in time"));
    assert_eq!(client.log().errors.len(), 1);
}

#[test]
fn commit_answer_timeout_is_fatal_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, _network, timer) = start_manager(PeerIndex::HOST, 2, client);

    let event = timer
        .fire_next(|kind| matches!(kind, TimerKind::CommitAnswerTimeout(_)))
        .unwrap();
    manager.handle_event(event);
    assert!(failure_reason(&manager).contains("not acknowledged in time"));
}

#[test]
fn stale_timer_events_are_ignored_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    let state_hash = broadcast_commit(&network.take_sent(), 1).unwrap().state_hash;

    // The commit timeout fires after the round it guards was committed, e.g., because its event was
    // already queued when it was cancelled.
    let commit_timeout = timer
        .handle_of(TimerKind::CommitTimeout(RoundIndex::new(1)))
        .unwrap();
    receive(&mut manager, GUEST, remote_commit(1, 5, 100, state_hash));
    manager.handle_event(SessionEvent::Timer {
        handle: commit_timeout,
        kind: TimerKind::CommitTimeout(RoundIndex::new(1)),
    });
    assert_eq!(manager.termination(), None);

    // A frame alarm that is not the armed one.
    manager.handle_event(SessionEvent::Timer {
        handle: TimerHandle::new(9999),
        kind: TimerKind::ExecuteFrame,
    });
    assert!(client.log().frames.is_empty());
}

#[test]
fn host_leaving_drains_committed_rounds_test() {
    let client = RecordingClient::idle(GUEST);
    let (mut manager, _network, timer) = start_manager(GUEST, 2, client.clone());

    fire_next_frame(&mut manager, &timer);
    assert!(manager.is_waiting());

    // Without the host, round 1 is committed by the local guest alone, so it still executes.
    receive(&mut manager, PeerIndex::HOST, Message::leave(String::from("closing"), Vec::new()));
    assert_eq!(manager.termination(), None);
    assert_eq!(manager.pipeline().current().index(), RoundIndex::new(1));

    while let Some(event) = timer.fire_next_frame() {
        manager.handle_event(event);
    }
    assert_eq!(manager.termination(), Some(&Termination::HostLeft));
    assert!(client.log().host_left);
    // One frame of round 0, then 100 / 50 + 1 frames of round 1.
    assert_eq!(client.log().frames.len(), 4);
}

#[test]
fn host_leaving_mid_round_terminates_test() {
    let client = RecordingClient::idle(GUEST);
    let (mut manager, network, timer) = start_manager(GUEST, 3, client.clone());
    let state_hash = broadcast_commit(&network.take_sent(), 1).unwrap().state_hash;

    receive(&mut manager, PeerIndex::HOST, remote_commit(1, 5, 100, state_hash));
    receive(&mut manager, PeerIndex::HOST, Message::leave(String::from("closing"), Vec::new()));
    assert_eq!(manager.termination(), Some(&Termination::HostLeft));
    assert!(client.log().host_left);
    assert!(timer.armed().is_empty());
    assert!(client.log().errors.is_empty());
}

#[test]
fn local_stop_broadcasts_leave_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    client.script([ExecuteFrameResponse::Stop {
        reason: String::from("quit"),
        custom: vec![7],
    }]);
    let (mut manager, network, timer) = start_manager(PeerIndex::HOST, 2, client);
    network.take_sent();

    fire_next_frame(&mut manager, &timer);
    assert_eq!(manager.termination(), Some(&Termination::Finished));
    assert_eq!(
        network.take_sent(),
        vec![(Recipients::Everyone, Message::leave(String::from("quit"), vec![7]))]
    );
    assert!(timer.armed().is_empty());
}

#[test]
fn peer_error_notice_is_fatal_without_echo_test() {
    let client = RecordingClient::idle(PeerIndex::HOST);
    let (mut manager, network, _timer) = start_manager(PeerIndex::HOST, 2, client.clone());
    network.take_sent();

    receive(&mut manager, GUEST, Message::simulation_error(String::from("boom"), vec![9]));
    assert_eq!(
        manager.termination(),
        Some(&Termination::Failed {
            reason: String::from("peer 1 failed: boom"),
            payload: vec![9],
        })
    );
    assert_eq!(
        client.log().errors,
        vec![(String::from("peer 1 failed: boom"), vec![9])]
    );
    assert!(!network
        .take_sent()
        .iter()
        .any(|(_, message)| matches!(message, Message::SimulationError(_))));
}

#[test]
fn single_peer_session_runs_alone_test() {
    let client = RecordingClient::busy(PeerIndex::HOST, Some(5));
    let (mut manager, _network, timer) = start_manager(PeerIndex::HOST, 1, client.clone());

    while let Some(event) = timer.fire_next_frame() {
        manager.handle_event(event);
    }
    assert_eq!(manager.termination(), Some(&Termination::Finished));
    assert_eq!(client.log().frames.len(), 5);
    // Commands issued in round 0 were delivered in round 2.
    assert!(client
        .log()
        .frames
        .iter()
        .any(|delivered| !delivered.is_empty()));
}
