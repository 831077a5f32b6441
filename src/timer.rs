/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](TimerService) for the alarm clock used by the simulation thread, as well as the
//! default thread-backed implementation.
//!
//! An alarm never calls back into the simulation thread directly. When it fires, a
//! [`SessionEvent::Timer`] carrying its [`TimerHandle`] and [`TimerKind`] is pushed onto the same event
//! queue that inbound network messages go through. Because of this, an alarm may fire *after* it was
//! cancelled if its event was already queued; the manager re-validates every timer event against the
//! handle it currently has armed, and drops stale ones.

use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::session::SessionEvent;
use crate::types::data_types::{RoundIndex, Ticket};

/// Opaque cancellation token for an armed alarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// What an alarm is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Execute the next simulation frame.
    ExecuteFrame,

    /// The given round should have been fully committed by now.
    CommitTimeout(RoundIndex),

    /// Every active peer should have acknowledged the commit with the given ticket by now.
    CommitAnswerTimeout(Ticket),
}

pub trait TimerService: Send {
    /// The current time according to this timer service.
    fn now(&self) -> Instant;

    /// Arm a one-shot alarm that fires at `at` (immediately, if `at` is in the past).
    fn set_alarm(&mut self, at: Instant, kind: TimerKind) -> TimerHandle;

    /// Cancel an alarm. Cancelling an alarm that already fired is a no-op.
    fn cancel(&mut self, handle: TimerHandle);
}

/// Upper bound on how long the timer thread blocks without checking its shutdown signal.
const IDLE_POLL_PERIOD: Duration = Duration::from_millis(50);

enum TimerCommand {
    Set {
        at: Instant,
        handle: TimerHandle,
        kind: TimerKind,
    },
    Cancel(TimerHandle),
}

/// [`TimerService`] backed by a dedicated thread that keeps a deadline-ordered set of alarms.
pub struct ThreadTimer {
    next_handle: u64,
    commands: Sender<TimerCommand>,
}

impl TimerService for ThreadTimer {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn set_alarm(&mut self, at: Instant, kind: TimerKind) -> TimerHandle {
        let handle = TimerHandle::new(self.next_handle);
        self.next_handle += 1;
        // The timer thread only exits on shutdown, after the simulation thread has stopped.
        let _ = self.commands.send(TimerCommand::Set { at, handle, kind });
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        let _ = self.commands.send(TimerCommand::Cancel(handle));
    }
}

/// Spawn the timer thread, which pushes a [`SessionEvent::Timer`] onto `events` whenever an alarm
/// armed through the returned [`ThreadTimer`] fires.
pub(crate) fn start_timer(
    events: SyncSender<SessionEvent>,
    shutdown_signal: Receiver<()>,
) -> (ThreadTimer, JoinHandle<()>) {
    let (commands, command_receiver) = mpsc::channel();

    let timer_thread = thread::spawn(move || {
        let mut alarms: BTreeMap<(Instant, TimerHandle), TimerKind> = BTreeMap::new();
        let mut deadlines: HashMap<TimerHandle, Instant> = HashMap::new();

        loop {
            match shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    panic!("Timer thread disconnected from main thread")
                }
            }

            // Fire every alarm that is due.
            let now = Instant::now();
            loop {
                let (at, handle) = match alarms.keys().next() {
                    Some(&(at, handle)) if at <= now => (at, handle),
                    _ => break,
                };
                let kind = match alarms.remove(&(at, handle)) {
                    Some(kind) => kind,
                    None => break,
                };
                deadlines.remove(&handle);
                if events.send(SessionEvent::Timer { handle, kind }).is_err() {
                    // The simulation thread has terminated; nobody is left to wake up.
                    return;
                }
            }

            let wait = alarms
                .keys()
                .next()
                .map(|(at, _)| at.saturating_duration_since(now))
                .unwrap_or(IDLE_POLL_PERIOD)
                .min(IDLE_POLL_PERIOD);

            match command_receiver.recv_timeout(wait) {
                Ok(TimerCommand::Set { at, handle, kind }) => {
                    alarms.insert((at, handle), kind);
                    deadlines.insert(handle, at);
                }
                Ok(TimerCommand::Cancel(handle)) => {
                    if let Some(at) = deadlines.remove(&handle) {
                        alarms.remove(&(at, handle));
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    });

    (
        ThreadTimer {
            next_handle: 0,
            commands,
        },
        timer_thread,
    )
}
