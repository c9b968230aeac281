/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The Tendermint-style round state machine, and the components that feed it: the timeout ticker, the
//! write-ahead log, and the per-height vote bookkeeping.

use std::{
    sync::mpsc::{Receiver, Sender},
    thread::{self, JoinHandle},
};

use thiserror::Error;

use crate::{
    block_store::BlockStoreError,
    error::{Fault, HasSeverity, Severity},
    mempool::Mempool,
    service::ServiceError,
    state::{kv_store::KVStore, StateError},
    types::{block::BlockError, part_set::PartSetError, vote_set::VoteSetError},
};

pub mod config;

pub mod height_vote_set;
use height_vote_set::HeightVoteSetError;

pub mod messages;
use messages::ConsensusInput;

pub(crate) mod replay;

pub mod round_state;

pub mod state;
use state::ConsensusState;

pub mod ticker;

pub mod wal;
use wal::WalError;

/// Run `consensus_state` on its own thread until `shutdown` fires. An error that the state machine cannot
/// carry on from is sent to `faults` before the thread exits.
pub(crate) fn start_consensus<K: KVStore, M: Mempool>(
    mut consensus_state: ConsensusState<K, M>,
    input: Receiver<ConsensusInput>,
    shutdown: Receiver<()>,
    faults: Sender<Fault>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let result = consensus_state
            .start()
            .and_then(|()| consensus_state.receive_routine(&input, &shutdown));
        if let Err(err) = result {
            log::error!(target: consensus_state.log.target(), "consensus stopped: {}", err);
            let _ = faults.send(Fault::new("consensus", &err));
        }
        consensus_state.stop();
    })
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Wal(#[from] WalError),
    #[error("cannot apply committed block: {0}")]
    Finalize(StateError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error(transparent)]
    Vote(#[from] HeightVoteSetError),
    #[error("precommit for the last block rejected: {0}")]
    LastCommit(VoteSetError),
    #[error("proposal is not signed by the proposer of its round")]
    InvalidProposalSignature,
    #[error("proposal's POL round is not before its round")]
    InvalidProposalPolRound,
    #[error(transparent)]
    BlockPart(#[from] PartSetError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("consensus invariant broken: {0}")]
    Invariant(&'static str),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl HasSeverity for ConsensusError {
    fn severity(&self) -> Severity {
        match self {
            ConsensusError::Wal(err) => err.severity(),
            ConsensusError::BlockStore(err) => err.severity(),
            ConsensusError::Service(err) => err.severity(),
            ConsensusError::Finalize(_) => Severity::Crisis,
            ConsensusError::Vote(HeightVoteSetError::RoundNotIncreasing { .. }) | ConsensusError::Invariant(_) => {
                Severity::Sanity
            }
            ConsensusError::Vote(_)
            | ConsensusError::LastCommit(_)
            | ConsensusError::InvalidProposalSignature
            | ConsensusError::InvalidProposalPolRound
            | ConsensusError::BlockPart(_)
            | ConsensusError::Block(_) => Severity::Recoverable,
        }
    }
}
