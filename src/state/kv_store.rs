/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Defines the [KVStore] trait, which specifies the required interface for the key-value store provided
//! by the user.
//!
//! Given a method to obtain the value for a given key in bytes, this module also provides methods to
//! obtain the borsh-encoded values that angine keeps in the store:
//!
//! |Key|Value|
//! |---|---|
//! |`stateKey`|The last committed [`State`].|
//! |`stateIntermediateKey`|The [`State`] saved after executing a block, before its commit.|
//! |`stateKey-<branch>`|A backup of the committed [`State`] made by [`StateTool`](super::state_tool::StateTool).|
//! |`blockStore`|The height of the highest stored block.|
//! |`H:<height>`|The [`BlockMeta`] of the block at `height`.|
//! |`B:<height>`|The [`Block`] at `height`.|
//! |`SC:<height>`|The precommits that this replica saw commit the block at `height`.|

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use thiserror::Error;

use super::State;
use crate::types::{
    block::{Block, BlockMeta, Commit},
    data_types::Height,
};

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /* ↓↓↓ State ↓↓↓ */

    fn state(&self) -> Result<Option<State>, KVGetError> {
        get_borsh(self, Key::State)
    }

    fn intermediate_state(&self) -> Result<Option<State>, KVGetError> {
        get_borsh(self, Key::StateIntermediate)
    }

    fn state_backup(&self, branch: &str) -> Result<Option<State>, KVGetError> {
        get_borsh(
            self,
            Key::StateBackup {
                branch: branch.to_string(),
            },
        )
    }

    /* ↓↓↓ Block store ↓↓↓ */

    fn block_store_height(&self) -> Result<Height, KVGetError> {
        Ok(get_borsh(self, Key::BlockStoreHeight)?.unwrap_or_default())
    }

    fn block(&self, height: Height) -> Result<Option<Block>, KVGetError> {
        get_borsh(self, Key::Block { height })
    }

    fn block_meta(&self, height: Height) -> Result<Option<BlockMeta>, KVGetError> {
        get_borsh(self, Key::BlockMeta { height })
    }

    fn seen_commit(&self, height: Height) -> Result<Option<Commit>, KVGetError> {
        get_borsh(self, Key::SeenCommit { height })
    }
}

fn get_borsh<K: KVGet + ?Sized, T: BorshDeserialize>(kv: &K, key: Key) -> Result<Option<T>, KVGetError> {
    match kv.get(&key.bytes()) {
        None => Ok(None),
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|source| KVGetError::DeserializeValueError { key, source }),
    }
}

/// Serialize `value` into `wb` under `key`.
pub(crate) fn set_borsh<W: WriteBatch, T: BorshSerialize>(wb: &mut W, key: Key, value: &T) -> Result<(), KVSetError> {
    let bytes = value
        .try_to_vec()
        .map_err(|source| KVSetError::SerializeValueError { key: key.clone(), source })?;
    wb.set(&key.bytes(), &bytes);
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Key {
    State,
    StateIntermediate,
    StateBackup { branch: String },
    BlockStoreHeight,
    BlockMeta { height: Height },
    Block { height: Height },
    SeenCommit { height: Height },
}

impl Key {
    pub fn bytes(&self) -> Vec<u8> {
        match self {
            Key::State => b"stateKey".to_vec(),
            Key::StateIntermediate => b"stateIntermediateKey".to_vec(),
            Key::StateBackup { branch } => format!("stateKey-{}", branch).into_bytes(),
            Key::BlockStoreHeight => b"blockStore".to_vec(),
            Key::BlockMeta { height } => format!("H:{}", height).into_bytes(),
            Key::Block { height } => format!("B:{}", height).into_bytes(),
            Key::SeenCommit { height } => format!("SC:{}", height).into_bytes(),
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::State => write!(f, "State"),
            Key::StateIntermediate => write!(f, "Intermediate State"),
            Key::StateBackup { branch } => write!(f, "State backup {}", branch),
            Key::BlockStoreHeight => write!(f, "Block Store Height"),
            Key::BlockMeta { height } => write!(f, "Block Meta at height {}", height),
            Key::Block { height } => write!(f, "Block at height {}", height),
            Key::SeenCommit { height } => write!(f, "Seen Commit for height {}", height),
        }
    }
}

#[derive(Debug, Error)]
pub enum KVGetError {
    #[error("cannot deserialize {key}: {source}")]
    DeserializeValueError { key: Key, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum KVSetError {
    #[error("cannot serialize {key}: {source}")]
    SerializeValueError { key: Key, source: std::io::Error },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapGet(HashMap<Vec<u8>, Vec<u8>>);

    impl KVGet for MapGet {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.get(key).cloned()
        }
    }

    #[test]
    fn keys_follow_store_layout() {
        assert_eq!(Key::State.bytes(), b"stateKey");
        assert_eq!(Key::StateIntermediate.bytes(), b"stateIntermediateKey");
        assert_eq!(
            Key::StateBackup {
                branch: "pre-upgrade".into()
            }
            .bytes(),
            b"stateKey-pre-upgrade"
        );
        assert_eq!(Key::SeenCommit { height: Height::new(12) }.bytes(), b"SC:12");
    }

    #[test]
    fn missing_and_corrupt_values() {
        let mut map = HashMap::new();
        let kv = MapGet(map.clone());
        assert_eq!(kv.block_store_height().unwrap(), Height::new(0));
        assert!(kv.state().unwrap().is_none());

        map.insert(Key::State.bytes(), vec![1, 2, 3]);
        let kv = MapGet(map);
        assert!(matches!(
            kv.state(),
            Err(KVGetError::DeserializeValueError { key: Key::State, .. })
        ));
    }
}
