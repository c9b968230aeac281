/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Validator] and [ValidatorSet] types and their associated methods.
//!
//! A `ValidatorSet` is a plain value. Cloning it produces a fully independent copy, which the block
//! execution pipeline relies on to stage the next validator set without disturbing the committed one.

use std::slice;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    block::{BlockID, Commit},
    crypto_primitives::verify,
    data_types::{Address, ChainID, CryptoHash, Height, Power, PublicKeyBytes, TotalPower},
    vote::VoteType,
};

/// A member of the validator set.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub pub_key: PublicKeyBytes,
    pub voting_power: Power,
    /// Proposer-selection accumulator. Starts at 0 and is advanced by
    /// [`ValidatorSet::increment_accum`].
    pub accum: i64,
    /// Whether this validator may act as a certificate authority for the permissioned chain.
    pub is_ca: bool,
}

impl Validator {
    pub fn new(pub_key: PublicKeyBytes, voting_power: Power, is_ca: bool) -> Validator {
        Validator {
            address: pub_key.address(),
            pub_key,
            voting_power,
            accum: 0,
            is_ca,
        }
    }

    /// Returns whichever of `self` and `other` should be preferred as proposer: the one with the higher
    /// accum, or the one with the smaller address if their accums are equal.
    fn compare_accum<'a>(&'a self, other: &'a Validator) -> &'a Validator {
        if self.accum > other.accum {
            self
        } else if self.accum < other.accum {
            other
        } else if self.address <= other.address {
            self
        } else {
            other
        }
    }
}

/// Identities of validators, their voting powers, and the proposer-selection state.
///
/// Validators are kept in ascending order of their addresses, so that their index in the set (which votes
/// carry) is stable across replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<Validator>,
}

impl ValidatorSet {
    /// Create a validator set out of `validators`. Duplicate addresses keep the last entry.
    ///
    /// Accums are left untouched until the first call to [`increment_accum`](Self::increment_accum).
    pub fn new(validators: Vec<Validator>) -> ValidatorSet {
        let mut validators = validators;
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        validators.dedup_by(|later, earlier| {
            if later.address == earlier.address {
                *earlier = later.clone();
                true
            } else {
                false
            }
        });

        ValidatorSet {
            validators,
            proposer: None,
        }
    }

    /// Advance every validator's accum by `voting_power * times`, and pick a proposer once per unit of
    /// `times`. The validator picked on the last iteration becomes the set's proposer.
    pub fn increment_accum(&mut self, times: u32) {
        if self.validators.is_empty() || times == 0 {
            return;
        }

        for validator in self.validators.iter_mut() {
            validator.accum += validator.voting_power.int() as i64 * times as i64;
        }

        let total = self.total_voting_power().int() as i64;
        for i in 0..times {
            let mut mostest = 0;
            for (idx, validator) in self.validators.iter().enumerate() {
                if std::ptr::eq(validator.compare_accum(&self.validators[mostest]), validator) {
                    mostest = idx;
                }
            }
            if i == times - 1 {
                self.proposer = Some(self.validators[mostest].clone());
            }
            self.validators[mostest].accum -= total;
        }
    }

    /// The validator whose turn it is to propose.
    pub fn proposer(&self) -> Option<&Validator> {
        match &self.proposer {
            Some(proposer) => Some(proposer),
            None => self
                .validators
                .iter()
                .reduce(|best, validator| best.compare_accum(validator)),
        }
    }

    /// Get an iterator through the validators in ascending order of their addresses.
    pub fn validators(&self) -> slice::Iter<Validator> {
        self.validators.iter()
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Get the index and value of the validator with `address`.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|idx| (idx, &self.validators[idx]))
    }

    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Mutable access to a member, used by block executables that rotate validator powers.
    pub fn get_mut_by_address(&mut self, address: &Address) -> Option<&mut Validator> {
        self.validators
            .binary_search_by(|v| v.address.cmp(address))
            .ok()
            .map(|idx| &mut self.validators[idx])
    }

    pub fn total_voting_power(&self) -> TotalPower {
        let mut total = TotalPower::new(0);
        for validator in &self.validators {
            total += validator.voting_power;
        }
        total
    }

    /// The minimum voting power that makes up more than two thirds of the total.
    pub fn quorum(&self) -> TotalPower {
        TotalPower::new(self.total_voting_power().int() * 2 / 3 + 1)
    }

    /// SHA256 hash of the validators' addresses, keys, and powers.
    ///
    /// Accums are excluded, so the hash identifies membership and not proposer-selection progress.
    pub fn hash(&self) -> CryptoHash {
        let members: Vec<(Address, PublicKeyBytes, Power)> = self
            .validators
            .iter()
            .map(|v| (v.address, v.pub_key, v.voting_power))
            .collect();
        match members.try_to_vec() {
            Ok(bytes) => CryptoHash::digest(&bytes),
            Err(_) => CryptoHash::default(),
        }
    }

    /// Verify that `commit` contains valid precommits for `block_id` at `height` from more than two
    /// thirds of the voting power of this set.
    pub fn verify_commit(
        &self,
        chain_id: &ChainID,
        block_id: &BlockID,
        height: Height,
        commit: &Commit,
    ) -> Result<(), CommitError> {
        if self.len() != commit.precommits.len() {
            return Err(CommitError::WrongSize {
                expected: self.len(),
                got: commit.precommits.len(),
            });
        }
        let round = commit.round().ok_or(CommitError::Empty)?;
        if commit.height() != Some(height) {
            return Err(CommitError::WrongHeight {
                expected: height,
                got: commit.height(),
            });
        }

        let mut tallied = TotalPower::new(0);
        for (idx, precommit) in commit.precommits.iter().enumerate() {
            let Some(precommit) = precommit else { continue };
            if precommit.height != height || precommit.round != round {
                return Err(CommitError::InconsistentVote { index: idx });
            }
            if precommit.vote_type != VoteType::Precommit {
                return Err(CommitError::InconsistentVote { index: idx });
            }
            let validator = &self.validators[idx];
            if validator.address != precommit.validator_address {
                return Err(CommitError::WrongValidator { index: idx });
            }
            if !verify(&validator.pub_key, &precommit.sign_bytes(chain_id), &precommit.signature) {
                return Err(CommitError::InvalidSignature { index: idx });
            }
            if precommit.block_id.as_ref() == Some(block_id) {
                tallied += validator.voting_power;
            }
        }

        if tallied >= self.quorum() {
            Ok(())
        } else {
            Err(CommitError::InsufficientPower {
                got: tallied,
                needed: self.quorum(),
            })
        }
    }
}

/// Reasons why [`ValidatorSet::verify_commit`] can reject a commit.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("commit has {got} precommits, expected {expected}")]
    WrongSize { expected: usize, got: usize },
    #[error("commit has no precommits")]
    Empty,
    #[error("commit is for height {got:?}, expected {expected}")]
    WrongHeight { expected: Height, got: Option<Height> },
    #[error("precommit {index} does not match the commit's height, round, or type")]
    InconsistentVote { index: usize },
    #[error("precommit {index} was not cast by the validator at that index")]
    WrongValidator { index: usize },
    #[error("precommit {index} has an invalid signature")]
    InvalidSignature { index: usize },
    #[error("commit carries {got} voting power, needed {needed}")]
    InsufficientPower { got: TotalPower, needed: TotalPower },
}
