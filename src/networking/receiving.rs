/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions for receiving messages from the P2P network.

use std::{
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
};

use super::network::Network;
use crate::{
    consensus::messages::{ConsensusInput, MsgInfo},
    logging::LogHandle,
};

/// Spawn the poller thread, which polls the [`Network`] for messages and forwards them into the round
/// state machine's input channel.
///
/// Messages that claim to come from the empty peer key (which is reserved for the local replica) are
/// dropped.
pub(crate) fn start_polling<N: Network + 'static>(
    mut network: N,
    to_consensus: Sender<ConsensusInput>,
    shutdown_signal: Receiver<()>,
    log: LogHandle,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => return,
            Err(TryRecvError::Empty) => (),
        }

        if let Some((peer_key, msg)) = network.recv() {
            if peer_key.is_empty() {
                log::warn!(target: log.target(), "dropping message from a peer with an empty key");
                continue;
            }
            if to_consensus.send(ConsensusInput::Peer(MsgInfo { msg, peer_key })).is_err() {
                // Consensus has stopped.
                return;
            }
        } else {
            thread::yield_now()
        }
    })
}
