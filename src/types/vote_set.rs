/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`VoteSet`] type, which tallies votes of one type for a single (height, round).

use std::collections::HashMap;

use thiserror::Error;

use super::{
    block::{BlockID, Commit},
    data_types::{Address, ChainID, Height, Round, TotalPower},
    validators::ValidatorSet,
    vote::{Vote, VoteType},
};

/// Collects prevotes or precommits cast in one (height, round) by the members of a validator set.
///
/// A validator may only vote once: a second vote for the same block is a duplicate, and a second vote for a
/// different block is rejected as [`VoteSetError::Conflicting`].
#[derive(Clone, Debug)]
pub struct VoteSet {
    chain_id: ChainID,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    votes: Vec<Option<Vote>>,
    sum: TotalPower,
    votes_by_block: HashMap<Option<BlockID>, TotalPower>,
    maj23: Option<Option<BlockID>>,
}

impl VoteSet {
    pub fn new(
        chain_id: ChainID,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: ValidatorSet,
    ) -> VoteSet {
        let size = validators.len();
        VoteSet {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; size],
            sum: TotalPower::new(0),
            votes_by_block: HashMap::new(),
            maj23: None,
        }
    }

    /// Rebuild the precommit set that produced `commit`. Used to recover the last commit on startup.
    pub fn from_commit(
        chain_id: ChainID,
        commit: &Commit,
        validators: ValidatorSet,
    ) -> Result<VoteSet, VoteSetError> {
        let height = commit.height().ok_or(VoteSetError::EmptyCommit)?;
        let round = commit.round().ok_or(VoteSetError::EmptyCommit)?;
        let mut vote_set = VoteSet::new(chain_id, height, round, VoteType::Precommit, validators);
        for precommit in commit.precommits.iter().flatten() {
            vote_set.add_vote(precommit.clone())?;
        }
        Ok(vote_set)
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    pub fn size(&self) -> usize {
        self.votes.len()
    }

    /// Add a signed vote. Returns `Ok(true)` if the vote was new, and `Ok(false)` if it was an exact
    /// duplicate.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height || vote.round != self.round || vote.vote_type != self.vote_type {
            return Err(VoteSetError::UnexpectedStep {
                height: vote.height,
                round: vote.round,
                vote_type: vote.vote_type,
            });
        }

        let index = vote.validator_index as usize;
        let validator = self
            .validators
            .get_by_index(index)
            .ok_or(VoteSetError::InvalidValidatorIndex { index })?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress {
                address: vote.validator_address,
            });
        }

        if let Some(existing) = &self.votes[index] {
            return if existing.block_id == vote.block_id {
                Ok(false)
            } else {
                Err(VoteSetError::Conflicting {
                    address: vote.validator_address,
                })
            };
        }

        if !vote.is_correct(&self.chain_id, &validator.pub_key) {
            return Err(VoteSetError::InvalidSignature {
                address: vote.validator_address,
            });
        }

        let power = validator.voting_power;
        let quorum = self.validators.quorum();
        let tally = self.votes_by_block.entry(vote.block_id).or_default();
        *tally += power;
        if *tally >= quorum && self.maj23.is_none() {
            self.maj23 = Some(vote.block_id);
        }
        self.sum += power;
        self.votes[index] = Some(vote);

        Ok(true)
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|vote| vote.as_ref())
    }

    pub fn get_by_address(&self, address: &Address) -> Option<&Vote> {
        let (index, _) = self.validators.get_by_address(address)?;
        self.get_by_index(index)
    }

    /// The block (or nil, as `Some(None)`) that more than two thirds of the voting power voted for, if any.
    pub fn two_thirds_majority(&self) -> Option<Option<BlockID>> {
        self.maj23
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether more than two thirds of the voting power has voted, for anything.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.validators.quorum()
    }

    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_voting_power()
    }

    /// Build a [`Commit`] out of a precommit set that has a majority for a block.
    pub fn make_commit(&self) -> Option<Commit> {
        if self.vote_type != VoteType::Precommit {
            return None;
        }
        let block_id = self.maj23??;
        Some(Commit {
            block_id: Some(block_id),
            precommits: self.votes.clone(),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteSetError {
    #[error("vote for height {height}, round {round}, type {vote_type:?} does not belong in this set")]
    UnexpectedStep {
        height: Height,
        round: Round,
        vote_type: VoteType,
    },
    #[error("no validator at index {index}")]
    InvalidValidatorIndex { index: usize },
    #[error("validator {address} is not at the index its vote claims")]
    InvalidValidatorAddress { address: Address },
    #[error("vote from {address} has an invalid signature")]
    InvalidSignature { address: Address },
    #[error("validator {address} voted for two different blocks")]
    Conflicting { address: Address },
    #[error("commit has no precommits")]
    EmptyCommit,
}
