use std::{
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use lockstep_rs::{
    messages::Message,
    networking::network::{Network, NetworkEvent},
    types::data_types::PeerIndex,
};
use rand::Rng;

/// A mock network stub which passes frames from and to threads using channels. Every broadcast is
/// delayed by a small random amount to shake up the interleaving of peers.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: PeerIndex,
    all_peers: Vec<Sender<NetworkEvent>>,
    inbox: Arc<Mutex<Receiver<NetworkEvent>>>,
}

impl Network for NetworkStub {
    fn broadcast(&mut self, frame: Vec<u8>) {
        jitter();
        for (peer, sender) in self.all_peers.iter().enumerate() {
            if peer != self.me.int() {
                let _ = sender.send(NetworkEvent::Message {
                    origin: self.me,
                    frame: frame.clone(),
                });
            }
        }
    }

    fn send(&mut self, peers: &[PeerIndex], frame: Vec<u8>) {
        jitter();
        for peer in peers {
            if let Some(sender) = self.all_peers.get(peer.int()) {
                let _ = sender.send(NetworkEvent::Message {
                    origin: self.me,
                    frame: frame.clone(),
                });
            }
        }
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            // Every other peer's session has shut down.
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

fn jitter() {
    let micros = rand::thread_rng().gen_range(0, 300);
    thread::sleep(Duration::from_micros(micros));
}

pub(crate) fn mock_network(peer_count: usize) -> Vec<NetworkStub> {
    let (all_peers, inboxes): (Vec<Sender<NetworkEvent>>, Vec<Receiver<NetworkEvent>>) =
        (0..peer_count).map(|_| mpsc::channel()).unzip();

    inboxes
        .into_iter()
        .enumerate()
        .map(|(me, inbox)| NetworkStub {
            me: PeerIndex::new(me),
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}

/// Who a recorded message was addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Recipients {
    Everyone,
    Peers(Vec<PeerIndex>),
}

/// A network that receives nothing and records everything that is sent through it, decoded.
#[derive(Clone, Default)]
pub(crate) struct RecordingNetwork {
    outbox: Arc<Mutex<Vec<(Recipients, Message)>>>,
}

impl RecordingNetwork {
    pub(crate) fn new() -> RecordingNetwork {
        RecordingNetwork::default()
    }

    /// Remove and return everything sent since the last call.
    pub(crate) fn take_sent(&self) -> Vec<(Recipients, Message)> {
        std::mem::take(&mut *self.outbox.lock().unwrap())
    }
}

impl Network for RecordingNetwork {
    fn broadcast(&mut self, frame: Vec<u8>) {
        let message = Message::decode(&frame).unwrap();
        self.outbox.lock().unwrap().push((Recipients::Everyone, message));
    }

    fn send(&mut self, peers: &[PeerIndex], frame: Vec<u8>) {
        let message = Message::decode(&frame).unwrap();
        self.outbox
            .lock()
            .unwrap()
            .push((Recipients::Peers(peers.to_vec()), message));
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        None
    }
}
