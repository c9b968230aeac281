use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use angine::{
    consensus::messages::ConsensusMessage,
    networking::{Network, PeerKey},
};

/// A mock network stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    my_key: PeerKey,
    all_peers: HashMap<PeerKey, Sender<(PeerKey, ConsensusMessage)>>,
    inbox: Arc<Mutex<Receiver<(PeerKey, ConsensusMessage)>>>,
}

impl Network for NetworkStub {
    fn peers(&self) -> Vec<PeerKey> {
        self.all_peers
            .keys()
            .filter(|peer| **peer != self.my_key)
            .cloned()
            .collect()
    }

    fn send(&mut self, peer: &PeerKey, message: ConsensusMessage) {
        if let Some(peer) = self.all_peers.get(peer) {
            let _ = peer.send((self.my_key.clone(), message));
        }
    }

    fn recv(&mut self) -> Option<(PeerKey, ConsensusMessage)> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(o_m) => Some(o_m),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub(crate) fn mock_network(peers: impl Iterator<Item = PeerKey>) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let peer_and_inboxes: Vec<(PeerKey, Receiver<(PeerKey, ConsensusMessage)>)> = peers
        .map(|peer| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(peer.clone(), sender);

            (peer, receiver)
        })
        .collect();

    peer_and_inboxes
        .into_iter()
        .map(|(my_key, inbox)| NetworkStub {
            my_key,
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
