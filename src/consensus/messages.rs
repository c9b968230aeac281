/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages exchanged by replicas' round state machines, and the inputs of a round state machine.

use serde::{Deserialize, Serialize};

use super::round_state::TimeoutInfo;
use crate::{
    networking::PeerKey,
    types::{
        data_types::{Height, Round},
        part_set::Part,
        vote::{Proposal, Vote},
    },
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart(BlockPartMessage),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> Height {
        match self {
            ConsensusMessage::Proposal(proposal) => proposal.height,
            ConsensusMessage::BlockPart(block_part) => block_part.height,
            ConsensusMessage::Vote(vote) => vote.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            ConsensusMessage::Proposal(proposal) => proposal.round,
            ConsensusMessage::BlockPart(block_part) => block_part.round,
            ConsensusMessage::Vote(vote) => vote.round,
        }
    }
}

/// One part of the block proposed in (`height`, `round`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPartMessage {
    pub height: Height,
    pub round: Round,
    pub part: Part,
}

/// A consensus message together with the peer it came from. An empty `peer_key` marks our own messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub msg: ConsensusMessage,
    pub peer_key: PeerKey,
}

impl MsgInfo {
    pub fn is_own(&self) -> bool {
        self.peer_key.is_empty()
    }
}

/// What the round state machine's receive loop consumes, apart from its own queued messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusInput {
    Peer(MsgInfo),
    Timeout(TimeoutInfo),
}

impl From<TimeoutInfo> for ConsensusInput {
    fn from(ti: TimeoutInfo) -> Self {
        ConsensusInput::Timeout(ti)
    }
}
