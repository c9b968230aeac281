/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The height/round/step position of the round state machine, and everything it has seen in the current
//! height.

use std::{
    fmt::{self, Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::height_vote_set::HeightVoteSet;
use crate::types::{
    block::Block,
    data_types::{Height, Round, Timestamp},
    part_set::PartSet,
    validators::ValidatorSet,
    vote::Proposal,
    vote_set::VoteSet,
};

/// Steps of a round, in the order they are entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RoundStepType {
    /// Waiting out the commit timeout of the previous height.
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    /// Saw +2/3 prevotes for anything, waiting for stragglers.
    PrevoteWait,
    Precommit,
    /// Saw +2/3 precommits for anything, waiting for stragglers.
    PrecommitWait,
    /// Saw +2/3 precommits for a block, waiting for the block.
    Commit,
}

impl Display for RoundStepType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request to the [`TimeoutTicker`](super::ticker::TimeoutTicker) to fire after `duration`, unless the
/// state machine has moved past (`height`, `round`, `step`) by then.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInfo {
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

impl TimeoutInfo {
    pub fn key(&self) -> (Height, Round, RoundStepType) {
        (self.height, self.round, self.step)
    }
}

impl Display for TimeoutInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} @ {}/{}/{}", self.duration, self.height, self.round, self.step)
    }
}

/// The part of the round state that is written to the write-ahead log on every step transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStateRecord {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
}

/// Everything the round state machine knows about the height it is working on.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: RoundStepType,
    /// When round 0 of this height should start.
    pub start_time: Timestamp,
    /// When +2/3 precommits for a block were seen in this height. Zero until then.
    pub commit_time: Timestamp,
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    pub locked_round: Option<Round>,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    pub commit_round: Option<Round>,
    /// Precommits for the previous height's block. `None` at height 1.
    pub last_commit: Option<VoteSet>,
    pub last_validators: ValidatorSet,
}

impl RoundState {
    pub fn record(&self) -> RoundStateRecord {
        RoundStateRecord {
            height: self.height,
            round: self.round,
            step: self.step,
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
