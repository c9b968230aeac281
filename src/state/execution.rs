/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block execution and the atomic commit of its results.
//!
//! ## Pipeline
//!
//! [`apply_block`] is [`exec_block`] followed by [`commit_state_update_mempool`]:
//! 1. Validate the block through the [`BlockVerifier`]. An invalid block leaves the state untouched.
//! 2. Copy the current validator set twice: once as the set that executed the block, once as the next set.
//! 3. [`BlockExecutable::begin_block`], then the application's `on_execute` hook, then
//!    [`BlockExecutable::end_block`], which may change the next set.
//! 4. Advance the next set's proposer selection, and move the state to the block.
//! 5. Save the state as the intermediate state.
//! 6. Under the mempool's lock, remove the block's transactions and call `on_commit`. If `on_commit` fails,
//!    the mempool update is rolled back under the same lock and the state's hashes are not touched.
//!
//! The committed state is saved by the caller, once it has decided to keep the result.

use std::{sync::mpsc::Sender, sync::Arc, time::SystemTime};

use super::{kv_store::KVStore, State, StateError};
use crate::{
    events::{Event, TxEvent},
    hooks::{CommitResult, HookArgs, Hooks},
    logging::LogHandle,
    mempool::{Mempool, MempoolGuard},
    types::{
        block::Block,
        data_types::Round,
        part_set::PartSetHeader,
        validators::ValidatorSet,
    },
};

/// Decides whether a block may extend the chain.
pub trait BlockVerifier: Send + Sync {
    fn validate_block(&self, state: &State, block: &Block) -> Result<(), StateError> {
        state.validate_block(block)
    }
}

/// Checks blocks with [`State::validate_block`] and nothing else.
pub struct DefaultBlockVerifier;

impl BlockVerifier for DefaultBlockVerifier {}

/// Chain-level processing that brackets the application's execution of a block.
pub trait BlockExecutable: Send {
    fn begin_block(&mut self, _block: &Block, _validators: &ValidatorSet) -> Result<(), StateError> {
        Ok(())
    }

    /// May change `next_validators`, which take over from the block after this one.
    fn end_block(&mut self, _block: &Block, _next_validators: &mut ValidatorSet) -> Result<(), StateError> {
        Ok(())
    }
}

/// A [`BlockExecutable`] that never changes the validator set.
pub struct DefaultBlockExecutable;

impl BlockExecutable for DefaultBlockExecutable {}

/// Everything block execution needs beyond the state itself.
pub struct ExecutionContext<K: KVStore> {
    pub(crate) kv_store: K,
    pub(crate) verifier: Arc<dyn BlockVerifier>,
    pub(crate) executable: Box<dyn BlockExecutable>,
    pub(crate) hooks: Hooks,
    pub(crate) event_publisher: Option<Sender<Event>>,
    pub(crate) log: LogHandle,
}

impl<K: KVStore> ExecutionContext<K> {
    pub fn new(
        kv_store: K,
        verifier: Arc<dyn BlockVerifier>,
        executable: Box<dyn BlockExecutable>,
        hooks: Hooks,
        event_publisher: Option<Sender<Event>>,
        log: LogHandle,
    ) -> ExecutionContext<K> {
        ExecutionContext {
            kv_store,
            verifier,
            executable,
            hooks,
            event_publisher,
            log,
        }
    }

    pub fn kv_store(&self) -> &K {
        &self.kv_store
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }
}

/// Execute `block` on top of `state`, and save the result as the intermediate state.
pub fn exec_block<K: KVStore>(
    state: &mut State,
    ctx: &mut ExecutionContext<K>,
    block: &Block,
    block_parts_header: PartSetHeader,
    round: Round,
) -> Result<(), StateError> {
    ctx.verifier.validate_block(state, block)?;

    let signed = block.last_commit.precommits.iter().filter(|vote| vote.is_some()).count();
    log::debug!(
        target: ctx.log.target(),
        "executing block {} at height {} ({} txs, last commit signed by {} of {})",
        block.hash(),
        block.header.height,
        block.header.num_txs,
        signed,
        block.last_commit.precommits.len()
    );

    let prev_validators = state.validators.clone();
    let mut next_validators = state.validators.clone();

    ctx.executable.begin_block(block, &prev_validators)?;
    let result = ctx.hooks.on_execute.sync(HookArgs {
        height: block.header.height,
        round,
        block: Some(block),
    })?;
    if let Some(error) = result.error {
        return Err(StateError::Execute(error));
    }
    for (txs, valid) in [(&result.valid_txs, true), (&result.invalid_txs, false)] {
        for tx in txs {
            Event::publish(
                &ctx.event_publisher,
                Event::Tx(TxEvent {
                    timestamp: SystemTime::now(),
                    height: block.header.height,
                    tx: tx.hash(),
                    valid,
                }),
            );
        }
    }
    ctx.executable.end_block(block, &mut next_validators)?;

    next_validators.increment_accum(1);
    state.set_block_and_validators(&block.header, block_parts_header, prev_validators, next_validators);

    state.save_intermediate(&mut ctx.kv_store)?;
    Ok(())
}

/// Remove `block`'s transactions from the mempool and have the application commit the block, storing the
/// resulting hashes in `state`. Both happen under the mempool's lock.
pub fn commit_state_update_mempool<K: KVStore, M: Mempool>(
    state: &mut State,
    ctx: &mut ExecutionContext<K>,
    mempool: &M,
    block: &Block,
    round: Round,
) -> Result<(), StateError> {
    let mut guard = mempool.lock();
    guard.update(block.header.height, &block.data.txs);

    let commit = ctx.hooks.on_commit.sync(HookArgs {
        height: block.header.height,
        round,
        block: Some(block),
    });
    match commit {
        Ok(CommitResult { app_hash, receipts_hash }) => {
            state.app_hash = app_hash;
            state.receipts_hash = receipts_hash;
            Ok(())
        }
        Err(err) => {
            guard.rollback();
            log::error!(target: ctx.log.target(), "commit of height {} failed: {}", block.header.height, err);
            Err(err.into())
        }
    }
}

/// Execute and commit `block` on top of `state`.
pub fn apply_block<K: KVStore, M: Mempool>(
    state: &mut State,
    ctx: &mut ExecutionContext<K>,
    mempool: &M,
    block: &Block,
    block_parts_header: PartSetHeader,
    round: Round,
) -> Result<(), StateError> {
    exec_block(state, ctx, block, block_parts_header, round)?;
    commit_state_update_mempool(state, ctx, mempool, block, round)
}
