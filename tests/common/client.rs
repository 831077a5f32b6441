use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use lockstep_rs::{
    client::{ExecuteFrameResponse, SimulationClient},
    types::data_types::{Command, PeerIndex, StateHash},
};

/// Everything a [`RecordingClient`] observed.
#[derive(Default)]
pub(crate) struct ClientLog {
    /// The commands delivered before each executed frame, in delivery order.
    pub(crate) frames: Vec<Vec<(PeerIndex, Command)>>,
    pub(crate) errors: Vec<(String, Vec<u8>)>,
    pub(crate) peers_left: Vec<PeerIndex>,
    pub(crate) host_left: bool,
    pending: Vec<(PeerIndex, Command)>,
}

/// A deterministic simulation whose state is the sequence of commands it was delivered. Its log is shared
/// so that tests can inspect it while the client is owned by a manager or a session.
#[derive(Clone)]
pub(crate) struct RecordingClient {
    me: PeerIndex,
    log: Arc<Mutex<ClientLog>>,
    script: Arc<Mutex<VecDeque<ExecuteFrameResponse>>>,
    issue_commands: bool,
    stop_after: Option<usize>,
}

impl RecordingClient {
    /// A client that issues no commands and never stops.
    pub(crate) fn idle(me: PeerIndex) -> RecordingClient {
        RecordingClient {
            me,
            log: Arc::new(Mutex::new(ClientLog::default())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            issue_commands: false,
            stop_after: None,
        }
    }

    /// A client that issues one command per frame, and asks to stop after `stop_after` frames if set.
    pub(crate) fn busy(me: PeerIndex, stop_after: Option<usize>) -> RecordingClient {
        RecordingClient {
            issue_commands: true,
            stop_after,
            ..RecordingClient::idle(me)
        }
    }

    /// Queue responses to be returned by the next calls to `execute_frame`, before falling back to the
    /// default behavior.
    pub(crate) fn script(&self, responses: impl IntoIterator<Item = ExecuteFrameResponse>) {
        self.script.lock().unwrap().extend(responses);
    }

    pub(crate) fn log(&self) -> std::sync::MutexGuard<'_, ClientLog> {
        self.log.lock().unwrap()
    }
}

impl SimulationClient for RecordingClient {
    fn execute_frame(&mut self) -> ExecuteFrameResponse {
        let mut log = self.log.lock().unwrap();
        let delivered = std::mem::take(&mut log.pending);
        log.frames.push(delivered);
        let executed = log.frames.len();
        drop(log);

        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return response;
        }
        if self.stop_after.map_or(false, |stop_after| executed >= stop_after) {
            return ExecuteFrameResponse::Stop {
                reason: String::from("done"),
                custom: Vec::new(),
            };
        }
        if self.issue_commands {
            let command = Command::new(vec![self.me.int() as u8, (executed % 256) as u8]);
            return ExecuteFrameResponse::Continue {
                commands: vec![command],
            };
        }
        ExecuteFrameResponse::idle()
    }

    fn deliver_host_command(&mut self, command: Command) {
        self.log.lock().unwrap().pending.push((PeerIndex::HOST, command));
    }

    fn deliver_guest_command(&mut self, peer: PeerIndex, command: Command) {
        self.log.lock().unwrap().pending.push((peer, command));
    }

    fn state_hash(&mut self) -> StateHash {
        let log = self.log.lock().unwrap();
        let mut state = Vec::new();
        for (frame, commands) in log.frames.iter().enumerate() {
            state.extend_from_slice(&(frame as u32).to_le_bytes());
            for (peer, command) in commands {
                state.push(peer.int() as u8);
                state.extend_from_slice(command.bytes());
            }
        }
        StateHash::digest(&state)
    }

    fn on_simulation_error(&mut self, reason: &str, payload: &[u8]) {
        self.log
            .lock()
            .unwrap()
            .errors
            .push((reason.to_string(), payload.to_vec()));
    }

    fn on_peer_left(&mut self, peer: PeerIndex) {
        self.log.lock().unwrap().peers_left.push(peer);
    }

    fn on_host_left(&mut self) {
        self.log.lock().unwrap().host_left = true;
    }
}
