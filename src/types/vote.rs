/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signed consensus messages: [`Vote`]s (prevotes and precommits) and [`Proposal`]s.
//!
//! Both are signed over the borsh encoding of `(chain_id, body)`, where the body is every field but the
//! signature.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use super::{
    block::BlockID,
    crypto_primitives::verify,
    data_types::{Address, ChainID, Height, PublicKeyBytes, Round, SignatureBytes},
    part_set::PartSetHeader,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

/// A prevote or precommit from a single validator. A `block_id` of `None` is a vote for nil.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Vote {
    pub validator_address: Address,
    pub validator_index: u32,
    pub height: Height,
    pub round: Round,
    pub vote_type: VoteType,
    pub block_id: Option<BlockID>,
    pub signature: SignatureBytes,
}

#[derive(BorshSerialize)]
struct VoteSignBytes {
    chain_id: ChainID,
    validator_address: Address,
    validator_index: u32,
    height: Height,
    round: Round,
    vote_type: VoteType,
    block_id: Option<BlockID>,
}

impl Vote {
    /// Create an unsigned vote. The signature is filled in by a
    /// [`PrivValidator`](super::priv_validator::PrivValidator).
    pub fn new(
        validator_address: Address,
        validator_index: u32,
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: Option<BlockID>,
    ) -> Vote {
        Vote {
            validator_address,
            validator_index,
            height,
            round,
            vote_type,
            block_id,
            signature: SignatureBytes::new([0u8; 64]),
        }
    }

    pub fn sign_bytes(&self, chain_id: &ChainID) -> Vec<u8> {
        VoteSignBytes {
            chain_id: chain_id.clone(),
            validator_address: self.validator_address,
            validator_index: self.validator_index,
            height: self.height,
            round: self.round,
            vote_type: self.vote_type,
            block_id: self.block_id,
        }
        .try_to_vec()
        .unwrap_or_default()
    }

    pub fn is_correct(&self, chain_id: &ChainID, pub_key: &PublicKeyBytes) -> bool {
        verify(pub_key, &self.sign_bytes(chain_id), &self.signature)
    }
}

/// A proposer's signed claim that the block identified by `block_parts_header` is its proposal for
/// (`height`, `round`).
///
/// `pol_round` is the latest round in which this replica saw a polka, if any. Receivers treat the
/// proposal as complete only once they also hold that polka.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub block_parts_header: PartSetHeader,
    pub pol_round: Option<Round>,
    pub pol_block_id: Option<BlockID>,
    pub signature: SignatureBytes,
}

#[derive(BorshSerialize)]
struct ProposalSignBytes {
    chain_id: ChainID,
    height: Height,
    round: Round,
    block_parts_header: PartSetHeader,
    pol_round: Option<Round>,
    pol_block_id: Option<BlockID>,
}

impl Proposal {
    pub fn new(
        height: Height,
        round: Round,
        block_parts_header: PartSetHeader,
        pol_round: Option<Round>,
        pol_block_id: Option<BlockID>,
    ) -> Proposal {
        Proposal {
            height,
            round,
            block_parts_header,
            pol_round,
            pol_block_id,
            signature: SignatureBytes::new([0u8; 64]),
        }
    }

    pub fn sign_bytes(&self, chain_id: &ChainID) -> Vec<u8> {
        ProposalSignBytes {
            chain_id: chain_id.clone(),
            height: self.height,
            round: self.round,
            block_parts_header: self.block_parts_header,
            pol_round: self.pol_round,
            pol_block_id: self.pol_block_id,
        }
        .try_to_vec()
        .unwrap_or_default()
    }

    pub fn is_correct(&self, chain_id: &ChainID, pub_key: &PublicKeyBytes) -> bool {
        verify(pub_key, &self.sign_bytes(chain_id), &self.signature)
    }
}
