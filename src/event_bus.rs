/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event bus thread, which receives [events](crate::events::Event) from the simulation thread and
//! fires the handlers registered for each kind of event: the user-defined handlers passed to the
//! [session spec](crate::session::SessionSpec), and the default loggers if
//! [logging is enabled](crate::config::Configuration::log_events).

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

/// Upper bound on how long the event bus blocks without checking its shutdown signal.
const IDLE_POLL_PERIOD: Duration = Duration::from_millis(50);

pub(crate) struct EventHandlers {
    pub(crate) commit_handlers: Vec<HandlerPtr<CommitEvent>>,
    pub(crate) receive_commit_handlers: Vec<HandlerPtr<ReceiveCommitEvent>>,
    pub(crate) receive_commit_ack_handlers: Vec<HandlerPtr<ReceiveCommitAckEvent>>,
    pub(crate) start_round_handlers: Vec<HandlerPtr<StartRoundEvent>>,
    pub(crate) wait_for_commit_handlers: Vec<HandlerPtr<WaitForCommitEvent>>,
    pub(crate) resume_from_wait_handlers: Vec<HandlerPtr<ResumeFromWaitEvent>>,
    pub(crate) peer_left_handlers: Vec<HandlerPtr<PeerLeftEvent>>,
    pub(crate) host_left_handlers: Vec<HandlerPtr<HostLeftEvent>>,
    pub(crate) simulation_error_handlers: Vec<HandlerPtr<SimulationErrorEvent>>,
    pub(crate) terminate_handlers: Vec<HandlerPtr<TerminateEvent>>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        commit_handler: Option<HandlerPtr<CommitEvent>>,
        receive_commit_handler: Option<HandlerPtr<ReceiveCommitEvent>>,
        receive_commit_ack_handler: Option<HandlerPtr<ReceiveCommitAckEvent>>,
        start_round_handler: Option<HandlerPtr<StartRoundEvent>>,
        wait_for_commit_handler: Option<HandlerPtr<WaitForCommitEvent>>,
        resume_from_wait_handler: Option<HandlerPtr<ResumeFromWaitEvent>>,
        peer_left_handler: Option<HandlerPtr<PeerLeftEvent>>,
        host_left_handler: Option<HandlerPtr<HostLeftEvent>>,
        simulation_error_handler: Option<HandlerPtr<SimulationErrorEvent>>,
        terminate_handler: Option<HandlerPtr<TerminateEvent>>,
    ) -> EventHandlers {
        EventHandlers {
            commit_handlers: handlers_for(log_events, commit_handler),
            receive_commit_handlers: handlers_for(log_events, receive_commit_handler),
            receive_commit_ack_handlers: handlers_for(log_events, receive_commit_ack_handler),
            start_round_handlers: handlers_for(log_events, start_round_handler),
            wait_for_commit_handlers: handlers_for(log_events, wait_for_commit_handler),
            resume_from_wait_handlers: handlers_for(log_events, resume_from_wait_handler),
            peer_left_handlers: handlers_for(log_events, peer_left_handler),
            host_left_handlers: handlers_for(log_events, host_left_handler),
            simulation_error_handlers: handlers_for(log_events, simulation_error_handler),
            terminate_handlers: handlers_for(log_events, terminate_handler),
        }
    }

    /// Whether no handler at all is registered, in which case the event bus thread is not started.
    pub(crate) fn is_empty(&self) -> bool {
        self.commit_handlers.is_empty()
            && self.receive_commit_handlers.is_empty()
            && self.receive_commit_ack_handlers.is_empty()
            && self.start_round_handlers.is_empty()
            && self.wait_for_commit_handlers.is_empty()
            && self.resume_from_wait_handlers.is_empty()
            && self.peer_left_handlers.is_empty()
            && self.host_left_handlers.is_empty()
            && self.simulation_error_handlers.is_empty()
            && self.terminate_handlers.is_empty()
    }

    pub(crate) fn fire_handlers(&self, event: Event) {
        match event {
            Event::Commit(commit_event) =>
                self.commit_handlers.iter().for_each(|handler| handler(&commit_event)),

            Event::ReceiveCommit(receive_commit_event) =>
                self.receive_commit_handlers.iter().for_each(|handler| handler(&receive_commit_event)),

            Event::ReceiveCommitAck(receive_commit_ack_event) =>
                self.receive_commit_ack_handlers.iter().for_each(|handler| handler(&receive_commit_ack_event)),

            Event::StartRound(start_round_event) =>
                self.start_round_handlers.iter().for_each(|handler| handler(&start_round_event)),

            Event::WaitForCommit(wait_for_commit_event) =>
                self.wait_for_commit_handlers.iter().for_each(|handler| handler(&wait_for_commit_event)),

            Event::ResumeFromWait(resume_from_wait_event) =>
                self.resume_from_wait_handlers.iter().for_each(|handler| handler(&resume_from_wait_event)),

            Event::PeerLeft(peer_left_event) =>
                self.peer_left_handlers.iter().for_each(|handler| handler(&peer_left_event)),

            Event::HostLeft(host_left_event) =>
                self.host_left_handlers.iter().for_each(|handler| handler(&host_left_event)),

            Event::SimulationError(simulation_error_event) =>
                self.simulation_error_handlers.iter().for_each(|handler| handler(&simulation_error_event)),

            Event::Terminate(terminate_event) =>
                self.terminate_handlers.iter().for_each(|handler| handler(&terminate_event)),
        }
    }
}

// The default logger goes first so that a log line precedes whatever the user's handler does.
fn handlers_for<T: Logger>(log_events: bool, user_handler: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
    let mut handlers: Vec<HandlerPtr<T>> = Vec::new();
    if log_events {
        handlers.push(T::get_logger());
    }
    if let Some(handler) = user_handler {
        handlers.push(handler);
    }
    handlers
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.recv_timeout(IDLE_POLL_PERIOD) {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(RecvTimeoutError::Timeout) => (),
            // The simulation thread has terminated and every event it published has been handled.
            Err(RecvTimeoutError::Disconnected) => {
                let _ = shutdown_signal.recv();
                return;
            }
        }
    })
}
