/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Storage for committed blocks, kept in the same [`KVStore`] as the chain state.
//!
//! Blocks are stored contiguously from height 1. Alongside each block, the store keeps its [`BlockMeta`]
//! and the commit that this replica saw for it (the "seen commit"), which is what the round state machine
//! rebuilds its last commit from after a restart.

use thiserror::Error;

use crate::{
    error::{HasSeverity, Severity},
    state::kv_store::{set_borsh, KVGetError, KVSetError, KVStore, Key, WriteBatch},
    types::{
        block::{Block, BlockID, BlockMeta, Commit},
        data_types::Height,
        part_set::PartSet,
    },
};

#[derive(Clone)]
pub struct KVBlockStore<K: KVStore> {
    kv_store: K,
}

impl<K: KVStore> KVBlockStore<K> {
    pub fn new(kv_store: K) -> KVBlockStore<K> {
        KVBlockStore { kv_store }
    }

    /// Height of the highest stored block, or 0 if the store is empty.
    pub fn height(&self) -> Result<Height, BlockStoreError> {
        Ok(self.kv_store.block_store_height()?)
    }

    pub fn load_block(&self, height: Height) -> Result<Option<Block>, BlockStoreError> {
        Ok(self.kv_store.block(height)?)
    }

    pub fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, BlockStoreError> {
        Ok(self.kv_store.block_meta(height)?)
    }

    pub fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, BlockStoreError> {
        Ok(self.kv_store.seen_commit(height)?)
    }

    /// Store `block`, which must be at the height right above the current one, atomically with its meta and
    /// `seen_commit`.
    pub fn save_block(&mut self, block: &Block, parts: &PartSet, seen_commit: &Commit) -> Result<(), BlockStoreError> {
        let height = block.header.height;
        let expected = self.height()? + 1;
        if height != expected {
            return Err(BlockStoreError::NonContiguous { expected, got: height });
        }
        if !parts.is_complete() {
            return Err(BlockStoreError::IncompleteParts { height });
        }

        let meta = BlockMeta {
            block_id: BlockID {
                hash: block.hash(),
                parts_header: parts.header(),
            },
            header: block.header.clone(),
        };
        let mut wb = K::WriteBatch::new();
        set_borsh(&mut wb, Key::BlockMeta { height }, &meta)?;
        set_borsh(&mut wb, Key::Block { height }, block)?;
        set_borsh(&mut wb, Key::SeenCommit { height }, seen_commit)?;
        set_borsh(&mut wb, Key::BlockStoreHeight, &height)?;
        self.kv_store.write(wb);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("cannot store block at height {got}, expected height {expected}")]
    NonContiguous { expected: Height, got: Height },
    #[error("cannot store block at height {height} without all of its parts")]
    IncompleteParts { height: Height },
    #[error(transparent)]
    KVGet(#[from] KVGetError),
    #[error(transparent)]
    KVSet(#[from] KVSetError),
}

impl HasSeverity for BlockStoreError {
    fn severity(&self) -> Severity {
        match self {
            BlockStoreError::NonContiguous { .. } | BlockStoreError::IncompleteParts { .. } => Severity::Sanity,
            BlockStoreError::KVGet(_) | BlockStoreError::KVSet(_) => Severity::Crisis,
        }
    }
}
