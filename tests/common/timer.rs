use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use lockstep_rs::{
    session::SessionEvent,
    timer::{TimerHandle, TimerKind, TimerService},
};

/// A timer service whose clock only moves when a test moves it. Alarms never fire on their own: tests
/// pop them with [`ManualTimer::fire_next`] and hand the resulting event to the manager.
#[derive(Clone)]
pub(crate) struct ManualTimer {
    state: Arc<Mutex<ManualTimerState>>,
}

struct ManualTimerState {
    now: Instant,
    next_handle: u64,
    alarms: BTreeMap<(Instant, TimerHandle), TimerKind>,
}

impl ManualTimer {
    pub(crate) fn new() -> ManualTimer {
        ManualTimer {
            state: Arc::new(Mutex::new(ManualTimerState {
                now: Instant::now(),
                next_handle: 0,
                alarms: BTreeMap::new(),
            })),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        self.state.lock().unwrap().now += by;
    }

    /// The kinds of every alarm currently armed, earliest first.
    pub(crate) fn armed(&self) -> Vec<TimerKind> {
        self.state.lock().unwrap().alarms.values().copied().collect()
    }

    pub(crate) fn handle_of(&self, kind: TimerKind) -> Option<TimerHandle> {
        self.state
            .lock()
            .unwrap()
            .alarms
            .iter()
            .find(|(_, armed)| **armed == kind)
            .map(|((_, handle), _)| *handle)
    }

    /// Fire the earliest armed alarm that satisfies `filter`, moving the clock forward to its deadline
    /// if it is in the future.
    pub(crate) fn fire_next(&self, filter: impl Fn(&TimerKind) -> bool) -> Option<SessionEvent> {
        let mut state = self.state.lock().unwrap();
        let (at, handle) = state
            .alarms
            .iter()
            .find(|(_, kind)| filter(kind))
            .map(|(key, _)| *key)?;
        let kind = state.alarms.remove(&(at, handle))?;
        if at > state.now {
            state.now = at;
        }
        Some(SessionEvent::Timer { handle, kind })
    }

    pub(crate) fn fire_next_frame(&self) -> Option<SessionEvent> {
        self.fire_next(|kind| *kind == TimerKind::ExecuteFrame)
    }
}

impl TimerService for ManualTimer {
    fn now(&self) -> Instant {
        self.state.lock().unwrap().now
    }

    fn set_alarm(&mut self, at: Instant, kind: TimerKind) -> TimerHandle {
        let mut state = self.state.lock().unwrap();
        let handle = TimerHandle::new(state.next_handle);
        state.next_handle += 1;
        state.alarms.insert((at, handle), kind);
        handle
    }

    fn cancel(&mut self, handle: TimerHandle) {
        self.state
            .lock()
            .unwrap()
            .alarms
            .retain(|(_, armed), _| *armed != handle);
    }
}
