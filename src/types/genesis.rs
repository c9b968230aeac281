/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The genesis document: the chain's identity and initial validator set.

use std::{fs, path::Path};

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    data_types::{now_millis, ChainID, CryptoHash, Power, PublicKeyBytes, Timestamp},
    validators::{Validator, ValidatorSet},
};

#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub pub_key: PublicKeyBytes,
    pub amount: Power,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_ca: bool,
}

/// Read from JSON when a node starts for the first time, and stored in the [`State`](crate::state::State)
/// thereafter.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct GenesisDoc {
    /// Milliseconds since the Unix Epoch. A missing or zero time is replaced by the current time when the
    /// document is loaded.
    #[serde(default)]
    pub genesis_time: Timestamp,
    pub chain_id: ChainID,
    pub validators: Vec<GenesisValidator>,
    #[serde(default)]
    pub app_hash: CryptoHash,
    #[serde(default)]
    pub receipts_hash: CryptoHash,
}

impl GenesisDoc {
    pub fn from_json(json: &str) -> Result<GenesisDoc, GenesisError> {
        let mut doc: GenesisDoc = serde_json::from_str(json)?;
        doc.validate_and_complete()?;
        Ok(doc)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<GenesisDoc, GenesisError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, GenesisError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate_and_complete(&mut self) -> Result<(), GenesisError> {
        if self.chain_id.as_str().is_empty() {
            return Err(GenesisError::EmptyChainID);
        }
        if self.validators.is_empty() {
            return Err(GenesisError::NoValidators);
        }
        if let Some(validator) = self.validators.iter().find(|v| v.amount.int() == 0) {
            return Err(GenesisError::ZeroPower {
                pub_key: validator.pub_key,
            });
        }
        if self.genesis_time == 0 {
            self.genesis_time = now_millis();
        }
        Ok(())
    }

    /// The validator set at height 1, before any accum increments.
    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|v| Validator::new(v.pub_key, v.amount, v.is_ca))
                .collect(),
        )
    }
}

#[derive(Debug, Error)]
pub enum GenesisError {
    #[error("cannot read genesis file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse genesis document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("genesis document has an empty chain id")]
    EmptyChainID,
    #[error("genesis document has no validators")]
    NoValidators,
    #[error("genesis validator {pub_key} has zero voting power")]
    ZeroPower { pub_key: PublicKeyBytes },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_document() {
        let pub_key = PublicKeyBytes::new([3u8; 32]);
        let json = format!(
            r#"{{"chain_id": "angine-test", "validators": [{{"pub_key": "{}", "amount": 100}}]}}"#,
            pub_key
        );
        let doc = GenesisDoc::from_json(&json).unwrap();
        assert_eq!(doc.chain_id, ChainID::new("angine-test"));
        assert!(doc.genesis_time > 0);
        assert!(doc.app_hash.is_zero());
        assert_eq!(doc.validator_set().len(), 1);
    }

    #[test]
    fn rejects_zero_power() {
        let json = format!(
            r#"{{"chain_id": "angine-test", "validators": [{{"pub_key": "{}", "amount": 0}}]}}"#,
            PublicKeyBytes::new([3u8; 32])
        );
        assert!(matches!(GenesisDoc::from_json(&json), Err(GenesisError::ZeroPower { .. })));
    }
}
