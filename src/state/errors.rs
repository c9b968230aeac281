/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Errors raised by the state layer: block validation and execution, persistence, and the handshake.

use thiserror::Error;

use super::kv_store::{KVGetError, KVSetError};
use crate::{
    block_store::BlockStoreError,
    error::{HasSeverity, Severity},
    hooks::HookError,
    types::{data_types::Height, genesis::GenesisError},
};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid block: {0}")]
    InvalidBlock(String),
    #[error("block at height {height} is not in the block store")]
    UnknownBlock { height: Height },
    #[error("stored block at height {height} does not match its meta")]
    BlockHashMismatch { height: Height },
    #[error("state is at height {app_height}, ahead of the block store at height {store_height}")]
    AppBlockHeightTooHigh { app_height: Height, store_height: Height },
    #[error("app hash after replaying height {height} does not match the next stored header")]
    LastStateMismatch { height: Height },
    #[error("persisted state at height {height} does not match the block store")]
    StateMismatch { height: Height },
    #[error("intermediate state does not follow the committed state: {0} differs")]
    IntermediateMismatch(&'static str),
    #[error("no intermediate state to recover from")]
    NoIntermediate,
    #[error("block execution failed: {0}")]
    Execute(String),
    #[error("state backup {branch:?} already exists")]
    BackupExists { branch: String },
    #[error("no state backup named {branch:?}")]
    NoBackup { branch: String },
    #[error("no committed state in the store")]
    NoState,
    #[error(transparent)]
    Hook(#[from] HookError),
    #[error(transparent)]
    Genesis(#[from] GenesisError),
    #[error(transparent)]
    BlockStore(#[from] BlockStoreError),
    #[error(transparent)]
    KVGet(#[from] KVGetError),
    #[error(transparent)]
    KVSet(#[from] KVSetError),
}

impl HasSeverity for StateError {
    fn severity(&self) -> Severity {
        match self {
            StateError::InvalidBlock(_)
            | StateError::UnknownBlock { .. }
            | StateError::BlockHashMismatch { .. }
            | StateError::AppBlockHeightTooHigh { .. }
            | StateError::LastStateMismatch { .. }
            | StateError::StateMismatch { .. }
            | StateError::BackupExists { .. }
            | StateError::NoBackup { .. }
            | StateError::NoState => Severity::Recoverable,
            StateError::IntermediateMismatch(_) | StateError::NoIntermediate => Severity::Sanity,
            StateError::Execute(_)
            | StateError::Hook(_)
            | StateError::Genesis(_)
            | StateError::KVGet(_)
            | StateError::KVSet(_) => Severity::Crisis,
            StateError::BlockStore(err) => err.severity(),
        }
    }
}
