/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reconciles the persisted [`State`] with the block store when a node starts.
//!
//! Blocks are saved to the block store before the state that results from them, so after a crash the
//! store can be ahead of the state, never behind it. The handshake brings the state up to the store:
//! - If the store is exactly one block ahead and an intermediate state for that block was saved, the block
//!   was executed but not committed. The commit is finished from the intermediate state.
//! - Otherwise, every missing block is applied in order. Each block's app hash must agree with the header
//!   of the block after it.

use super::{
    execution::{apply_block, commit_state_update_mempool, ExecutionContext},
    kv_store::KVStore,
    State, StateError,
};
use crate::{
    block_store::KVBlockStore,
    mempool::Mempool,
    types::{block::Block, data_types::Height, part_set::PartSetHeader},
};

pub fn handshake<K: KVStore, M: Mempool>(
    state: &mut State,
    ctx: &mut ExecutionContext<K>,
    block_store: &KVBlockStore<K>,
    mempool: &M,
) -> Result<(), StateError> {
    let app_height = state.last_block_height;
    let store_height = block_store.height()?;
    log::info!(
        target: ctx.log.target(),
        "handshake: state at height {}, block store at height {}",
        app_height,
        store_height
    );

    if store_height < app_height {
        return Err(StateError::AppBlockHeightTooHigh {
            app_height,
            store_height,
        });
    }

    if store_height == app_height {
        if app_height.int() > 0 {
            let meta = block_store
                .load_block_meta(store_height)?
                .ok_or(StateError::UnknownBlock { height: store_height })?;
            if state.last_block_id != Some(meta.block_id) {
                return Err(StateError::StateMismatch { height: app_height });
            }
        }
        return Ok(());
    }

    if store_height == app_height + 1 {
        let intermediate = ctx.kv_store.intermediate_state()?;
        if intermediate.map(|s| s.last_block_height) == Some(store_height) {
            return finish_commit(state, ctx, block_store, mempool, store_height);
        }
    }

    for height in (app_height.int() + 1)..=store_height.int() {
        let height = Height::new(height);
        let (block, parts_header) = load_checked_block(block_store, height)?;
        let round = block_store
            .load_seen_commit(height)?
            .and_then(|commit| commit.round())
            .unwrap_or_default();

        let mut next_state = state.clone();
        apply_block(&mut next_state, ctx, mempool, &block, parts_header, round)?;

        if height < store_height {
            let next_meta = block_store
                .load_block_meta(height + 1)?
                .ok_or(StateError::UnknownBlock { height: height + 1 })?;
            if next_meta.header.app_hash != next_state.app_hash {
                return Err(StateError::LastStateMismatch { height });
            }
        }

        next_state.save(&mut ctx.kv_store)?;
        *state = next_state;
        log::info!(target: ctx.log.target(), "handshake: replayed block at height {}", height);
    }
    Ok(())
}

/// Commit the block at `height`, which was already executed into the intermediate state.
fn finish_commit<K: KVStore, M: Mempool>(
    state: &mut State,
    ctx: &mut ExecutionContext<K>,
    block_store: &KVBlockStore<K>,
    mempool: &M,
    height: Height,
) -> Result<(), StateError> {
    let mut intermediate = state.load_intermediate(&ctx.kv_store)?;
    let (block, parts_header) = load_checked_block(block_store, height)?;
    let executed = intermediate.last_block_id.map(|id| (id.hash, id.parts_header));
    if executed != Some((block.hash(), parts_header)) {
        return Err(StateError::IntermediateMismatch("last block id"));
    }

    let round = block_store
        .load_seen_commit(height)?
        .and_then(|commit| commit.round())
        .unwrap_or_default();
    commit_state_update_mempool(&mut intermediate, ctx, mempool, &block, round)?;
    intermediate.save(&mut ctx.kv_store)?;
    *state = intermediate;
    log::info!(target: ctx.log.target(), "handshake: finished interrupted commit of height {}", height);
    Ok(())
}

fn load_checked_block<K: KVStore>(
    block_store: &KVBlockStore<K>,
    height: Height,
) -> Result<(Block, PartSetHeader), StateError> {
    let block = block_store
        .load_block(height)?
        .ok_or(StateError::UnknownBlock { height })?;
    let meta = block_store
        .load_block_meta(height)?
        .ok_or(StateError::UnknownBlock { height })?;
    if !block.hashes_to(&meta.block_id.hash) {
        return Err(StateError::BlockHashMismatch { height });
    }
    Ok((block, meta.block_id.parts_header))
}
