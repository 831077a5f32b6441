/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build and run a simulation session.
//!
//! A session is the simulation stage of one peer: it starts after the peers have connected to each other
//! and agreed on the membership, and ends with a [`Termination`].
//!
//! The key components of this module are:
//! - The builder-pattern interface to construct a [specification of the session](SessionSpec) with:
//!   1. `SessionSpec::builder` to construct a `SessionSpecBuilder`,
//!   2. The setters of the `SessionSpecBuilder`, and
//!   3. The `SessionSpecBuilder::build` method to construct a [SessionSpec],
//! - The function to [start](SessionSpec::start) a [Session] given its specification,
//! - [The type](Session) which keeps the session alive.
//!
//! ## Threads
//!
//! Starting a session spawns:
//! 1. The *poller*, which moves frames from the [network](crate::networking::network::Network) onto the
//!    event queue.
//! 2. The *timer*, which pushes alarms onto the event queue when they fire.
//! 3. The *simulation thread*, which owns the [`SimulationManager`] and dispatches the events on the queue
//!    to it one at a time, each to completion.
//! 4. The *event bus*, which fires user-defined [event](crate::events) handlers and loggers. Only
//!    started if at least one handler is registered or logging is enabled.
//!
//! The simulation thread is the only thread that touches simulation-stage state, so no locks are needed
//! beyond the queue itself.
//!
//! ## Starting a session
//!
//! ```ignore
//! let session =
//!     SessionSpec::builder()
//!     .client(client)
//!     .network(network)
//!     .configuration(configuration)
//!     .membership(Membership::all_active(4))
//!     .on_start_round(start_round_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//! - `.client(...)`
//! - `.network(...)`
//! - `.configuration(...)`
//! - `.membership(...)`
//!
//! ### Optional setters
//!
//! The optional setters are for registering user-defined event handlers for events from [crate::events]:
//! - `.on_commit(...)`
//! - `.on_receive_commit(...)`
//! - `.on_receive_commit_ack(...)`
//! - `.on_start_round(...)`
//! - `.on_wait_for_commit(...)`
//! - `.on_resume_from_wait(...)`
//! - `.on_peer_left(...)`
//! - `.on_host_left(...)`
//! - `.on_simulation_error(...)`
//! - `.on_terminate(...)`

use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::client::SimulationClient;
use crate::config::{Configuration, ConfigurationError};
use crate::event_bus::*;
use crate::events::*;
use crate::networking::{network::Network, receiving::start_polling};
use crate::simulation::manager::{SimulationManager, Termination};
use crate::timer::{start_timer, TimerHandle, TimerKind, TimerService};
use crate::types::{data_types::PeerIndex, membership::Membership};

/// Everything the simulation thread reacts to. Events are dispatched in the order they were enqueued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A frame arrived from `origin`. It is decoded on the simulation thread.
    Message { origin: PeerIndex, frame: Vec<u8> },

    /// The transport lost its connection to a peer.
    Disconnected(PeerIndex),

    /// An alarm armed through the [`TimerService`] fired.
    Timer { handle: TimerHandle, kind: TimerKind },

    /// The session handle was dropped.
    Shutdown,
}

/// Stores all necessary parameters and trait implementations required to run a [Session].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [SessionSpec]. On the builder call the following methods to construct a valid [SessionSpec].

    Required:
    - `.client(...)`
    - `.network(...)`
    - `.configuration(...)`
    - `.membership(...)`

    Optional:
    - `.on_commit(...)`
    - `.on_receive_commit(...)`
    - `.on_receive_commit_ack(...)`
    - `.on_start_round(...)`
    - `.on_wait_for_commit(...)`
    - `.on_resume_from_wait(...)`
    - `.on_peer_left(...)`
    - `.on_host_left(...)`
    - `.on_simulation_error(...)`
    - `.on_terminate(...)`
"))]
pub struct SessionSpec<C: SimulationClient, N: Network + 'static> {
    // Required parameters
    #[builder(setter(doc = "Set the simulation to be driven. The argument must implement the [SimulationClient](crate::client::SimulationClient) trait. Required."))]
    client: C,
    #[builder(setter(doc = "Set the implementation of peer-to-peer networking. The argument must implement the [Network](crate::networking::network::Network) trait. Required."))]
    network: N,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a session. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the peers that take part in the session. Required."))]
    membership: Membership,
    // Optional parameters
    #[builder(default, setter(transform = |handler: impl Fn(&CommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitEvent>),
    doc = "Register a handler closure to be invoked after the local peer broadcasts a commit. Optional."))]
    on_commit: Option<HandlerPtr<CommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCommitEvent>),
    doc = "Register a handler closure to be invoked after a commit is received from a peer. Optional."))]
    on_receive_commit: Option<HandlerPtr<ReceiveCommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveCommitAckEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveCommitAckEvent>),
    doc = "Register a handler closure to be invoked after a peer acknowledges a local commit. Optional."))]
    on_receive_commit_ack: Option<HandlerPtr<ReceiveCommitAckEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&StartRoundEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<StartRoundEvent>),
    doc = "Register a handler closure to be invoked after a round becomes the current round. Optional."))]
    on_start_round: Option<HandlerPtr<StartRoundEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&WaitForCommitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<WaitForCommitEvent>),
    doc = "Register a handler closure to be invoked after frame execution stalls on a missing commit. Optional."))]
    on_wait_for_commit: Option<HandlerPtr<WaitForCommitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ResumeFromWaitEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ResumeFromWaitEvent>),
    doc = "Register a handler closure to be invoked after frame execution resumes from a stall. Optional."))]
    on_resume_from_wait: Option<HandlerPtr<ResumeFromWaitEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PeerLeftEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PeerLeftEvent>),
    doc = "Register a handler closure to be invoked after a guest leaves or disconnects. Optional."))]
    on_peer_left: Option<HandlerPtr<PeerLeftEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&HostLeftEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<HostLeftEvent>),
    doc = "Register a handler closure to be invoked after the host leaves or disconnects. Optional."))]
    on_host_left: Option<HandlerPtr<HostLeftEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&SimulationErrorEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<SimulationErrorEvent>),
    doc = "Register a handler closure to be invoked after a fatal simulation error. Optional."))]
    on_simulation_error: Option<HandlerPtr<SimulationErrorEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TerminateEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TerminateEvent>),
    doc = "Register a handler closure to be invoked after the session terminates. Optional."))]
    on_terminate: Option<HandlerPtr<TerminateEvent>>,
}

impl<C: SimulationClient, N: Network + 'static> SessionSpec<C, N> {
    /// Starts all threads and channels associated with running a session, and returns the handles to them
    /// in a [Session] struct.
    pub fn start(self) -> Result<Session, ConfigurationError> {
        self.configuration.validate()?;

        let (event_queue, events) = mpsc::sync_channel(self.configuration.event_queue_capacity);

        let (poller_shutdown, poller_shutdown_receiver) = mpsc::channel();
        let poller = start_polling(self.network.clone(), event_queue.clone(), poller_shutdown_receiver);

        let (timer_shutdown, timer_shutdown_receiver) = mpsc::channel();
        let (timer, timer_thread) = start_timer(event_queue.clone(), timer_shutdown_receiver);

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_commit,
            self.on_receive_commit,
            self.on_receive_commit_ack,
            self.on_start_round,
            self.on_wait_for_commit,
            self.on_resume_from_wait,
            self.on_peer_left,
            self.on_host_left,
            self.on_simulation_error,
            self.on_terminate,
        );

        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let termination = Arc::new((Mutex::new(None), Condvar::new()));
        let manager = SimulationManager::new(
            self.configuration,
            self.client,
            self.network,
            timer,
            event_publisher,
        );
        let simulation = start_simulation(manager, self.membership, events, termination.clone());

        let (event_bus, event_bus_shutdown) = match event_subscriber {
            Some(event_subscriber) => {
                let (event_bus_shutdown, event_bus_shutdown_receiver) = mpsc::channel();
                let event_bus = start_event_bus(event_handlers, event_subscriber, event_bus_shutdown_receiver);
                (Some(event_bus), Some(event_bus_shutdown))
            }
            None => (None, None),
        };

        Ok(Session {
            termination,
            event_queue,
            simulation: Some(simulation),
            event_bus,
            event_bus_shutdown,
            timer: Some(timer_thread),
            timer_shutdown,
            poller: Some(poller),
            poller_shutdown,
        })
    }
}

type SharedTermination = Arc<(Mutex<Option<Termination>>, Condvar)>;

fn start_simulation<C: SimulationClient, N: Network + 'static, T: TimerService + 'static>(
    mut manager: SimulationManager<C, N, T>,
    membership: Membership,
    events: Receiver<SessionEvent>,
    termination: SharedTermination,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(error) = manager.reset(membership) {
            manager.simulation_stage_error(error);
        }

        while manager.termination().is_none() {
            match events.recv() {
                Ok(SessionEvent::Shutdown) | Err(_) => break,
                Ok(event) => manager.handle_event(event),
            }
        }

        if let Some(outcome) = manager.termination().cloned() {
            let (lock, terminated) = &*termination;
            let mut slot = match lock.lock() {
                Ok(slot) => slot,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(outcome);
            terminated.notify_all();
        }
    })
}

/// A handle to the background threads of a simulation session. When this value is dropped, all background
/// threads are gracefully shut down.
pub struct Session {
    termination: SharedTermination,
    event_queue: SyncSender<SessionEvent>,
    simulation: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    timer: Option<JoinHandle<()>>,
    timer_shutdown: Sender<()>,
    poller: Option<JoinHandle<()>>,
    poller_shutdown: Sender<()>,
}

impl Session {
    /// How the session ended, or `None` if it is still running.
    pub fn termination(&self) -> Option<Termination> {
        let (lock, _) = &*self.termination;
        match lock.lock() {
            Ok(termination) => termination.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Block until the session ends or `timeout` elapses, and return how it ended.
    pub fn wait_for_termination(&self, timeout: Duration) -> Option<Termination> {
        let (lock, terminated) = &*self.termination;
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match terminated.wait_timeout_while(guard, timeout, |termination| termination.is_none()) {
            Ok((termination, _)) => termination.clone(),
            Err(poisoned) => poisoned.into_inner().0.clone(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. The simulation thread owns the
        // event queue's receiver, so once it has exited, the timer and the poller can no longer block on a
        // full queue. The simulation thread, timer, and event bus may also have exited on their own after
        // the session terminated, so a failed shutdown send is expected.

        let _ = self.event_queue.send(SessionEvent::Shutdown);
        if let Some(simulation) = self.simulation.take() {
            simulation.join().unwrap();
        }

        self.event_bus_shutdown.iter().for_each(|shutdown| {
            let _ = shutdown.send(());
        });
        if let Some(event_bus) = self.event_bus.take() {
            event_bus.join().unwrap();
        }

        let _ = self.timer_shutdown.send(());
        if let Some(timer) = self.timer.take() {
            timer.join().unwrap();
        }

        let _ = self.poller_shutdown.send(());
        if let Some(poller) = self.poller.take() {
            poller.join().unwrap();
        }
    }
}
