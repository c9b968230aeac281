/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the [Block] type and the types it is made of.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    data_types::{Address, ChainID, CryptoHash, Height, Round, Timestamp, Tx},
    part_set::{PartSet, PartSetHeader},
    vote::{Vote, VoteType},
};

/// Uniquely identifies a block: its hash, and the header of the part set it was gossiped as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct BlockID {
    pub hash: CryptoHash,
    pub parts_header: PartSetHeader,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Header {
    pub chain_id: ChainID,
    pub height: Height,
    pub time: Timestamp,
    pub num_txs: u64,
    pub last_block_id: Option<BlockID>,
    pub last_commit_hash: CryptoHash,
    pub data_hash: CryptoHash,
    pub validators_hash: CryptoHash,
    pub app_hash: CryptoHash,
    pub receipts_hash: CryptoHash,
    pub last_non_empty_height: Height,
    pub proposer_address: Address,
}

impl Header {
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::digest(&self.try_to_vec().unwrap_or_default())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Data {
    pub txs: Vec<Tx>,
}

impl Data {
    /// SHA256 hash over the concatenated hashes of the transactions.
    pub fn hash(&self) -> CryptoHash {
        let mut concatenated = Vec::with_capacity(self.txs.len() * 32);
        for tx in &self.txs {
            concatenated.extend_from_slice(&tx.hash().bytes());
        }
        CryptoHash::digest(&concatenated)
    }
}

/// +2/3 precommits for a block, indexed by validator position in the set that produced them.
///
/// The commit carried by the first block is empty.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Commit {
    pub block_id: Option<BlockID>,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    fn first_precommit(&self) -> Option<&Vote> {
        self.precommits.iter().flatten().next()
    }

    pub fn height(&self) -> Option<Height> {
        self.first_precommit().map(|v| v.height)
    }

    pub fn round(&self) -> Option<Round> {
        self.first_precommit().map(|v| v.round)
    }

    pub fn hash(&self) -> CryptoHash {
        CryptoHash::digest(&self.try_to_vec().unwrap_or_default())
    }

    /// Structural checks that do not need a validator set.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.block_id.is_none() {
            return Err(BlockError::NilCommit);
        }
        let Some(first) = self.first_precommit() else {
            return Err(BlockError::EmptyCommit);
        };
        for precommit in self.precommits.iter().flatten() {
            if precommit.vote_type != VoteType::Precommit {
                return Err(BlockError::MalformedCommit("vote is not a precommit"));
            }
            if precommit.height != first.height || precommit.round != first.round {
                return Err(BlockError::MalformedCommit("precommits disagree on height or round"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Block {
    pub header: Header,
    pub data: Data,
    pub last_commit: Commit,
}

/// What the chain must look like for a block to extend it. Built from the current
/// [`State`](crate::state::State).
pub struct BlockContext<'a> {
    pub chain_id: &'a ChainID,
    pub last_block_height: Height,
    pub last_block_id: &'a Option<BlockID>,
    pub app_hash: CryptoHash,
    pub receipts_hash: CryptoHash,
    pub last_non_empty_height: Height,
}

impl Block {
    /// Assemble a new block at `height`, filling in the header's derived hashes.
    #[allow(clippy::too_many_arguments)]
    pub fn make_block(
        proposer_address: Address,
        height: Height,
        chain_id: ChainID,
        time: Timestamp,
        txs: Vec<Tx>,
        last_commit: Commit,
        last_block_id: Option<BlockID>,
        validators_hash: CryptoHash,
        app_hash: CryptoHash,
        receipts_hash: CryptoHash,
        last_non_empty_height: Height,
    ) -> Block {
        let data = Data { txs };
        Block {
            header: Header {
                chain_id,
                height,
                time,
                num_txs: data.txs.len() as u64,
                last_block_id,
                last_commit_hash: last_commit.hash(),
                data_hash: data.hash(),
                validators_hash,
                app_hash,
                receipts_hash,
                last_non_empty_height,
                proposer_address,
            },
            data,
            last_commit,
        }
    }

    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    pub fn hashes_to(&self, hash: &CryptoHash) -> bool {
        &self.hash() == hash
    }

    /// Encode this block and split it into parts of `part_size` bytes.
    pub fn make_part_set(&self, part_size: usize) -> PartSet {
        PartSet::from_data(&self.try_to_vec().unwrap_or_default(), part_size)
    }

    /// Reassemble a block from a complete part set.
    pub fn from_part_set(parts: &PartSet) -> Result<Block, BlockError> {
        let bytes = parts.assemble().map_err(|err| BlockError::Decode(err.to_string()))?;
        Block::try_from_slice(&bytes).map_err(|err| BlockError::Decode(err.to_string()))
    }

    /// Checks that this block extends the chain described by `ctx`. Does not verify the last commit's
    /// signatures; see [`ValidatorSet::verify_commit`](super::validators::ValidatorSet::verify_commit).
    pub fn validate_basic(&self, ctx: &BlockContext) -> Result<(), BlockError> {
        let header = &self.header;
        if &header.chain_id != ctx.chain_id {
            return Err(BlockError::WrongChainID {
                expected: ctx.chain_id.clone(),
                got: header.chain_id.clone(),
            });
        }
        if header.height != ctx.last_block_height + 1 {
            return Err(BlockError::WrongHeight {
                expected: ctx.last_block_height + 1,
                got: header.height,
            });
        }
        if header.last_non_empty_height != ctx.last_non_empty_height {
            return Err(BlockError::WrongLastNonEmptyHeight {
                expected: ctx.last_non_empty_height,
                got: header.last_non_empty_height,
            });
        }
        if header.num_txs != self.data.txs.len() as u64 {
            return Err(BlockError::WrongNumTxs {
                expected: self.data.txs.len() as u64,
                got: header.num_txs,
            });
        }
        if &header.last_block_id != ctx.last_block_id {
            return Err(BlockError::WrongField("last_block_id"));
        }
        if header.last_commit_hash != self.last_commit.hash() {
            return Err(BlockError::WrongField("last_commit_hash"));
        }
        if header.height.int() != 1 {
            self.last_commit.validate_basic()?;
        }
        if header.data_hash != self.data.hash() {
            return Err(BlockError::WrongField("data_hash"));
        }
        if header.app_hash != ctx.app_hash {
            return Err(BlockError::WrongField("app_hash"));
        }
        if header.receipts_hash != ctx.receipts_hash {
            return Err(BlockError::WrongField("receipts_hash"));
        }
        Ok(())
    }
}

/// Summary of a stored block, kept next to it in the block store.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockMeta {
    pub block_id: BlockID,
    pub header: Header,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("wrong chain id: expected {expected}, got {got}")]
    WrongChainID { expected: ChainID, got: ChainID },
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight { expected: Height, got: Height },
    #[error("wrong last non-empty height: expected {expected}, got {got}")]
    WrongLastNonEmptyHeight { expected: Height, got: Height },
    #[error("wrong number of transactions: expected {expected}, got {got}")]
    WrongNumTxs { expected: u64, got: u64 },
    #[error("header field {0} does not match")]
    WrongField(&'static str),
    #[error("commit cannot be for a nil block")]
    NilCommit,
    #[error("commit has no precommits")]
    EmptyCommit,
    #[error("malformed commit: {0}")]
    MalformedCommit(&'static str),
    #[error("cannot decode block: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_at_one(chain_id: &ChainID) -> Block {
        Block::make_block(
            Address::default(),
            Height::new(1),
            chain_id.clone(),
            0,
            vec![Tx::new(vec![1, 2, 3])],
            Commit::default(),
            None,
            CryptoHash::default(),
            CryptoHash::default(),
            CryptoHash::default(),
            Height::new(0),
        )
    }

    #[test]
    fn first_block_validates_against_genesis_context() {
        let chain_id = ChainID::new("test-chain");
        let block = block_at_one(&chain_id);
        let ctx = BlockContext {
            chain_id: &chain_id,
            last_block_height: Height::new(0),
            last_block_id: &None,
            app_hash: CryptoHash::default(),
            receipts_hash: CryptoHash::default(),
            last_non_empty_height: Height::new(0),
        };
        assert_eq!(block.validate_basic(&ctx), Ok(()));

        let mut tampered = block.clone();
        tampered.data.txs.push(Tx::new(vec![4]));
        assert!(matches!(tampered.validate_basic(&ctx), Err(BlockError::WrongNumTxs { .. })));
    }

    #[test]
    fn block_survives_part_set_round_trip() {
        let block = block_at_one(&ChainID::new("test-chain"));
        let parts = block.make_part_set(16);
        assert!(parts.total() > 1);
        assert_eq!(Block::from_part_set(&parts).unwrap(), block);
    }
}
