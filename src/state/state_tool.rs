/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Operator tooling for the committed state: named backups that can be restored later, e.g. around an
//! upgrade.

use super::{
    kv_store::{set_borsh, KVStore, Key, WriteBatch},
    State, StateError,
};
use crate::{logging::LogHandle, types::data_types::Height};

pub struct StateTool<K: KVStore> {
    kv_store: K,
    log: LogHandle,
}

impl<K: KVStore> StateTool<K> {
    pub fn new(kv_store: K, log: LogHandle) -> StateTool<K> {
        StateTool { kv_store, log }
    }

    /// Height of the committed state, or 0 if there is none.
    pub fn last_height(&self) -> Result<Height, StateError> {
        Ok(self
            .kv_store
            .state()?
            .map(|state| state.last_block_height)
            .unwrap_or_default())
    }

    /// Copy the committed state to `stateKey-<branch>`. Fails if that backup already exists.
    pub fn backup_last_state(&mut self, branch: &str) -> Result<(), StateError> {
        if self.kv_store.state_backup(branch)?.is_some() {
            return Err(StateError::BackupExists {
                branch: branch.to_string(),
            });
        }
        let state = self.kv_store.state()?.ok_or(StateError::NoState)?;
        self.write(
            Key::StateBackup {
                branch: branch.to_string(),
            },
            &state,
        )?;
        log::info!(target: self.log.target(), "backed up state at height {} as {:?}", state.last_block_height, branch);
        Ok(())
    }

    /// Replace the committed state with the backup named `branch`.
    pub fn revert_from_backup(&mut self, branch: &str) -> Result<(), StateError> {
        let backup = self
            .kv_store
            .state_backup(branch)?
            .ok_or_else(|| StateError::NoBackup {
                branch: branch.to_string(),
            })?;
        self.write(Key::State, &backup)?;
        log::info!(target: self.log.target(), "reverted state to height {} from {:?}", backup.last_block_height, branch);
        Ok(())
    }

    pub fn delete_backup(&mut self, branch: &str) -> Result<(), StateError> {
        if self.kv_store.state_backup(branch)?.is_none() {
            return Err(StateError::NoBackup {
                branch: branch.to_string(),
            });
        }
        let mut wb = K::WriteBatch::new();
        wb.delete(
            &Key::StateBackup {
                branch: branch.to_string(),
            }
            .bytes(),
        );
        self.kv_store.write(wb);
        Ok(())
    }

    fn write(&mut self, key: Key, state: &State) -> Result<(), StateError> {
        let mut wb = K::WriteBatch::new();
        set_borsh(&mut wb, key, state)?;
        self.kv_store.write(wb);
        Ok(())
    }
}
