/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The authoritative chain state of a replica, and the pipeline that advances it one block at a time.
//!
//! [`State`] is a plain value: it is only ever mutated through
//! [`set_block_and_validators`](State::set_block_and_validators) (during block execution) and
//! [`commit_state_update_mempool`](execution::commit_state_update_mempool) (which stores the application's
//! hashes), and it is persisted as a whole under `stateKey`.
//!
//! Executing a block saves the resulting state under `stateIntermediateKey` before its commit. If the
//! replica crashes before the committed state is saved, the [handshake](handshake) finds the intermediate
//! state, checks it against the committed one with [`load_intermediate`](State::load_intermediate), and
//! finishes the commit instead of executing the block again.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block::{Block, BlockContext, BlockID, Header},
    data_types::{ChainID, CryptoHash, Height, Timestamp},
    genesis::GenesisDoc,
    part_set::PartSetHeader,
    validators::ValidatorSet,
};

pub mod errors;
pub use errors::StateError;

pub mod execution;

pub mod handshake;

pub mod kv_store;
use kv_store::{set_borsh, KVGet, KVStore, Key, WriteBatch};

pub mod state_tool;

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct State {
    pub genesis_doc: GenesisDoc,
    pub chain_id: ChainID,
    /// 0 before the first block is committed.
    pub last_block_height: Height,
    pub last_block_id: Option<BlockID>,
    pub last_block_time: Timestamp,
    /// Validators of the next block.
    pub validators: ValidatorSet,
    /// Validators of the last block, who signed its commit.
    pub last_validators: ValidatorSet,
    pub app_hash: CryptoHash,
    pub receipts_hash: CryptoHash,
    /// Height of the last block that carried at least one transaction.
    pub last_non_empty_height: Height,
}

impl State {
    /// The state before the first block.
    pub fn make_genesis_state(genesis_doc: GenesisDoc) -> Result<State, StateError> {
        let mut genesis_doc = genesis_doc;
        genesis_doc.validate_and_complete()?;

        Ok(State {
            chain_id: genesis_doc.chain_id.clone(),
            last_block_height: Height::new(0),
            last_block_id: None,
            last_block_time: genesis_doc.genesis_time,
            validators: genesis_doc.validator_set(),
            last_validators: ValidatorSet::default(),
            app_hash: genesis_doc.app_hash,
            receipts_hash: genesis_doc.receipts_hash,
            last_non_empty_height: Height::new(0),
            genesis_doc,
        })
    }

    /// The last committed state, if any has been saved.
    pub fn load_state<K: KVGet>(kv_store: &K) -> Result<Option<State>, StateError> {
        Ok(kv_store.state()?)
    }

    /// The last committed state, or the genesis state (which is then saved) if the store holds none.
    pub fn get_or_make_genesis_state<K: KVStore>(kv_store: &mut K, genesis_doc: GenesisDoc) -> Result<State, StateError> {
        if let Some(state) = Self::load_state(kv_store)? {
            return Ok(state);
        }
        let state = Self::make_genesis_state(genesis_doc)?;
        state.save(kv_store)?;
        Ok(state)
    }

    pub fn save<K: KVStore>(&self, kv_store: &mut K) -> Result<(), StateError> {
        let mut wb = K::WriteBatch::new();
        set_borsh(&mut wb, Key::State, self)?;
        kv_store.write(wb);
        Ok(())
    }

    pub fn save_intermediate<K: KVStore>(&self, kv_store: &mut K) -> Result<(), StateError> {
        let mut wb = K::WriteBatch::new();
        set_borsh(&mut wb, Key::StateIntermediate, self)?;
        kv_store.write(wb);
        Ok(())
    }

    /// Load the intermediate state saved while executing the block after this one, checking that it
    /// follows from this state.
    pub fn load_intermediate<K: KVGet>(&self, kv_store: &K) -> Result<State, StateError> {
        let intermediate = kv_store.intermediate_state()?.ok_or(StateError::NoIntermediate)?;

        if intermediate.chain_id != self.chain_id {
            return Err(StateError::IntermediateMismatch("chain id"));
        }
        if intermediate.last_block_height != self.last_block_height + 1 {
            return Err(StateError::IntermediateMismatch("last block height"));
        }
        if intermediate.last_validators.hash() != self.validators.hash() {
            return Err(StateError::IntermediateMismatch("validator set"));
        }
        if intermediate.app_hash != self.app_hash {
            return Err(StateError::IntermediateMismatch("app hash"));
        }
        if intermediate.receipts_hash != self.receipts_hash {
            return Err(StateError::IntermediateMismatch("receipts hash"));
        }
        Ok(intermediate)
    }

    /// Advance to `header`, whose block was executed with `prev_validators`, and which hands over to
    /// `next_validators`.
    pub fn set_block_and_validators(
        &mut self,
        header: &Header,
        block_parts_header: PartSetHeader,
        prev_validators: ValidatorSet,
        next_validators: ValidatorSet,
    ) {
        self.last_block_height = header.height;
        self.last_block_id = Some(BlockID {
            hash: header.hash(),
            parts_header: block_parts_header,
        });
        self.last_block_time = header.time;
        self.validators = next_validators;
        self.last_validators = prev_validators;
        if header.num_txs > 0 {
            self.last_non_empty_height = header.height;
        }
    }

    pub fn block_context(&self) -> BlockContext<'_> {
        BlockContext {
            chain_id: &self.chain_id,
            last_block_height: self.last_block_height,
            last_block_id: &self.last_block_id,
            app_hash: self.app_hash,
            receipts_hash: self.receipts_hash,
            last_non_empty_height: self.last_non_empty_height,
        }
    }

    /// Check that `block` may be the next block of this chain: its header must extend this state, and,
    /// beyond the first block, it must carry a valid commit for the last block.
    pub fn validate_block(&self, block: &Block) -> Result<(), StateError> {
        block
            .validate_basic(&self.block_context())
            .map_err(|err| StateError::InvalidBlock(err.to_string()))?;
        if block.header.validators_hash != self.validators.hash() {
            return Err(StateError::InvalidBlock("validators hash does not match".into()));
        }

        if block.header.height.int() > 1 {
            let last_block_id = self
                .last_block_id
                .as_ref()
                .ok_or_else(|| StateError::InvalidBlock("no last block to commit".into()))?;
            self.last_validators
                .verify_commit(&self.chain_id, last_block_id, self.last_block_height, &block.last_commit)
                .map_err(|err| StateError::InvalidBlock(err.to_string()))?;
        }
        Ok(())
    }
}
