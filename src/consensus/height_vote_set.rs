/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! All the prevotes and precommits of a single height, across rounds.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::{
    networking::PeerKey,
    types::{
        block::BlockID,
        data_types::{ChainID, Height, Round},
        validators::ValidatorSet,
        vote::{Vote, VoteType},
        vote_set::{VoteSet, VoteSetError},
    },
};

#[derive(Clone, Debug)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Keeps the [`VoteSet`]s of every round from 0 up to the tracked round.
///
/// A commit can happen in any round, so peers are also allowed to open up to
/// [`MAX_CATCHUP_ROUNDS_PER_PEER`] rounds beyond the tracked one: one for their last commit, and one for
/// the round that commits the current height.
#[derive(Clone, Debug)]
pub struct HeightVoteSet {
    chain_id: ChainID,
    height: Height,
    validators: ValidatorSet,
    round: Round,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerKey, Vec<Round>>,
}

pub const MAX_CATCHUP_ROUNDS_PER_PEER: usize = 2;

impl HeightVoteSet {
    pub fn new(chain_id: ChainID, height: Height, validators: ValidatorSet) -> HeightVoteSet {
        let mut hvs = HeightVoteSet {
            chain_id,
            height,
            validators,
            round: Round::new(0),
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        hvs.add_round(Round::new(0));
        hvs
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    /// Open vote sets for every round up to and including `round`.
    pub fn set_round(&mut self, round: Round) -> Result<(), HeightVoteSetError> {
        if self.round != Round::new(0) && round <= self.round {
            return Err(HeightVoteSetError::RoundNotIncreasing {
                current: self.round,
                requested: round,
            });
        }
        for r in (self.round.int() + 1)..=round.int() {
            self.add_round(Round::new(r));
        }
        self.round = round;
        Ok(())
    }

    fn add_round(&mut self, round: Round) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let vote_set = |vote_type| VoteSet::new(self.chain_id.clone(), self.height, round, vote_type, self.validators.clone());
        let round_vote_set = RoundVoteSet {
            prevotes: vote_set(VoteType::Prevote),
            precommits: vote_set(VoteType::Precommit),
        };
        self.round_vote_sets.insert(round, round_vote_set);
    }

    /// Add a vote received from `peer_key` (empty for our own votes). Duplicates return `Ok(false)`.
    pub fn add_vote(&mut self, vote: Vote, peer_key: &PeerKey) -> Result<bool, HeightVoteSetError> {
        if !self.round_vote_sets.contains_key(&vote.round) {
            let rounds = self.peer_catchup_rounds.entry(peer_key.clone()).or_default();
            if rounds.len() >= MAX_CATCHUP_ROUNDS_PER_PEER {
                return Err(HeightVoteSetError::UnwantedRound {
                    peer_key: peer_key.clone(),
                    round: vote.round,
                });
            }
            rounds.push(vote.round);
            self.add_round(vote.round);
        }

        let vote_set = self
            .vote_set_mut(vote.round, vote.vote_type)
            .ok_or(HeightVoteSetError::UnwantedRound {
                peer_key: peer_key.clone(),
                round: vote.round,
            })?;
        Ok(vote_set.add_vote(vote)?)
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.prevotes)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.precommits)
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> Option<&mut VoteSet> {
        self.round_vote_sets.get_mut(&round).map(|rvs| match vote_type {
            VoteType::Prevote => &mut rvs.prevotes,
            VoteType::Precommit => &mut rvs.precommits,
        })
    }

    /// The latest round up to the tracked round with +2/3 prevotes for a block or for nil, together with
    /// what the prevotes were for.
    pub fn pol_info(&self) -> Option<(Round, Option<BlockID>)> {
        self.round_vote_sets
            .range(..=self.round)
            .rev()
            .find_map(|(round, rvs)| rvs.prevotes.two_thirds_majority().map(|block_id| (*round, block_id)))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeightVoteSetError {
    #[error("vote set round must increase: at {current}, asked for {requested}")]
    RoundNotIncreasing { current: Round, requested: Round },
    #[error("peer {peer_key:?} sent votes for too many unexpected rounds (latest {round})")]
    UnwantedRound { peer_key: PeerKey, round: Round },
    #[error(transparent)]
    VoteSet(#[from] VoteSetError),
}
