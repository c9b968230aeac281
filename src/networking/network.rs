/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::consensus::messages::ConsensusMessage;

/// Identifies a peer to the [`Network`] provider. The empty string is reserved for the local replica.
pub type PeerKey = String;

/// The peer-to-peer transport, provided by the library user.
///
/// Angine only ever sends its own consensus messages to peers, one peer at a time, through the node's
/// broadcast workers. How peers are discovered, connected, and authenticated is up to the provider.
pub trait Network: Clone + Send {
    /// The peers that messages should currently be sent to.
    fn peers(&self) -> Vec<PeerKey>;

    /// Send a message to the specified peer without blocking.
    fn send(&mut self, peer: &PeerKey, message: ConsensusMessage);

    /// Receive a message from any peer. Returns immediately with a None if no message is available now.
    fn recv(&mut self) -> Option<(PeerKey, ConsensusMessage)>;
}
