/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of angine events for event handling and logging.
//!
//! An event for a given action indicates that the action has been completed. Events are published by the
//! consensus and execution threads and delivered to user-registered handlers by the
//! [event bus](crate::event_bus) thread.

use std::{sync::mpsc::Sender, time::SystemTime};

use crate::{
    consensus::round_state::RoundStepType,
    types::{
        block::{Block, Header},
        data_types::{Address, CryptoHash, Height, Round},
        vote::Vote,
    },
};

pub enum Event {
    // Round state machine progress.
    NewRoundStep(NewRoundStepEvent),
    NewRound(NewRoundEvent),
    CompleteProposal(CompleteProposalEvent),
    Polka(PolkaEvent),
    Lock(LockEvent),
    Unlock(UnlockEvent),
    Relock(RelockEvent),
    TimeoutPropose(TimeoutProposeEvent),
    TimeoutWait(TimeoutWaitEvent),
    Vote(VoteEvent),
    // Block execution and commit.
    NewBlock(NewBlockEvent),
    NewBlockHeader(NewBlockHeaderEvent),
    Tx(TxEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            // The event bus only goes away during shutdown.
            let _ = event_publisher.send(event);
        }
    }
}

pub struct NewRoundStepEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

pub struct NewRoundEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub proposer: Option<Address>,
}

pub struct CompleteProposalEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block: CryptoHash,
}

/// +2/3 prevotes for a block (`Some`) or for nil (`None`).
pub struct PolkaEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block: Option<CryptoHash>,
}

pub struct LockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block: CryptoHash,
}

pub struct UnlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
}

pub struct RelockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block: CryptoHash,
}

pub struct TimeoutProposeEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
}

/// A prevote or precommit wait timed out.
pub struct TimeoutWaitEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

/// A vote, ours or a peer's, was added to the height's vote sets.
pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct NewBlockEvent {
    pub timestamp: SystemTime,
    pub block: Block,
}

pub struct NewBlockHeaderEvent {
    pub timestamp: SystemTime,
    pub header: Header,
}

/// A transaction of a committed block was executed.
pub struct TxEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub tx: CryptoHash,
    pub valid: bool,
}
