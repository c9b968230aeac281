/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Signing of votes and proposals on behalf of the local validator.
//!
//! A [`PrivValidator`] refuses to sign anything for a (height, round, step) older than the last one it
//! signed for. Re-signing the same step is allowed only for byte-identical sign bytes, in which case the
//! previous signature is returned.
//!
//! [`LocalPrivValidator::new`] keeps the last signed step in memory only, so the guard is lost when the
//! process exits. [`LocalPrivValidator::with_state_file`] also writes it to a JSON file, replaced
//! atomically before each signature is handed out, and reads it back on construction. Only a validator
//! built that way cannot double-sign across a restart.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf},
};

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    crypto_primitives::Keypair,
    data_types::{base64_bytes, Address, ChainID, Height, PublicKeyBytes, Round, SignatureBytes},
    vote::{Proposal, Vote, VoteType},
};

pub trait PrivValidator: Send {
    fn address(&self) -> Address;

    fn pub_key(&self) -> PublicKeyBytes;

    fn sign_vote(&mut self, chain_id: &ChainID, vote: &mut Vote) -> Result<(), PrivValidatorError>;

    fn sign_proposal(&mut self, chain_id: &ChainID, proposal: &mut Proposal) -> Result<(), PrivValidatorError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
enum SignStep {
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
}

impl From<VoteType> for SignStep {
    fn from(vote_type: VoteType) -> Self {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct LastSigned {
    height: Height,
    round: Round,
    step: SignStep,
    #[serde(with = "base64_bytes")]
    sign_bytes: Vec<u8>,
    signature: SignatureBytes,
}

/// A [`PrivValidator`] that holds its signing key in memory.
pub struct LocalPrivValidator {
    keypair: Keypair,
    last_signed: Option<LastSigned>,
    state_file: Option<PathBuf>,
}

impl LocalPrivValidator {
    pub fn new(keypair: Keypair) -> LocalPrivValidator {
        LocalPrivValidator {
            keypair,
            last_signed: None,
            state_file: None,
        }
    }

    /// Create a validator whose last signed step is kept in `path`. If the file exists, signing resumes
    /// from the step recorded in it.
    pub fn with_state_file(
        keypair: Keypair,
        path: impl Into<PathBuf>,
    ) -> Result<LocalPrivValidator, PrivValidatorError> {
        let path = path.into();
        let last_signed = match fs::read(&path) {
            Ok(bytes) => Some(serde_json::from_slice(&bytes).map_err(|source| PrivValidatorError::CorruptStateFile {
                path: path.clone(),
                source,
            })?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(source) => return Err(PrivValidatorError::StateFile { path, source }),
        };
        Ok(LocalPrivValidator {
            keypair,
            last_signed,
            state_file: Some(path),
        })
    }

    /// Create a validator with a freshly generated key.
    pub fn generate() -> LocalPrivValidator {
        Self::new(Keypair::new(SigningKey::generate(&mut OsRng)))
    }

    fn sign(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: Vec<u8>,
    ) -> Result<SignatureBytes, PrivValidatorError> {
        if let Some(last) = &self.last_signed {
            let hrs = (height, round, step);
            let last_hrs = (last.height, last.round, last.step);
            if hrs < last_hrs {
                return Err(PrivValidatorError::Regression {
                    height,
                    round,
                    last_height: last.height,
                    last_round: last.round,
                });
            }
            if hrs == last_hrs {
                return if last.sign_bytes == sign_bytes {
                    Ok(last.signature)
                } else {
                    Err(PrivValidatorError::Conflicting { height, round })
                };
            }
        }

        let signature = self.keypair.sign(&sign_bytes);
        let last_signed = LastSigned {
            height,
            round,
            step,
            sign_bytes,
            signature,
        };
        if let Some(path) = &self.state_file {
            write_state_file(path, &last_signed)?;
        }
        self.last_signed = Some(last_signed);
        Ok(signature)
    }
}

/// Replace the state file with `last_signed`: write a sibling temporary file, sync it, then rename it
/// over the old one.
fn write_state_file(path: &Path, last_signed: &LastSigned) -> Result<(), PrivValidatorError> {
    let json = serde_json::to_vec(last_signed).map_err(|source| PrivValidatorError::CorruptStateFile {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp_path = path.with_extension("tmp");
    let write = || -> io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        Ok(())
    };
    write().map_err(|source| PrivValidatorError::StateFile {
        path: path.to_path_buf(),
        source,
    })
}

impl PrivValidator for LocalPrivValidator {
    fn address(&self) -> Address {
        self.keypair.public_bytes().address()
    }

    fn pub_key(&self) -> PublicKeyBytes {
        self.keypair.public_bytes()
    }

    fn sign_vote(&mut self, chain_id: &ChainID, vote: &mut Vote) -> Result<(), PrivValidatorError> {
        let sign_bytes = vote.sign_bytes(chain_id);
        vote.signature = self.sign(vote.height, vote.round, vote.vote_type.into(), sign_bytes)?;
        Ok(())
    }

    fn sign_proposal(&mut self, chain_id: &ChainID, proposal: &mut Proposal) -> Result<(), PrivValidatorError> {
        let sign_bytes = proposal.sign_bytes(chain_id);
        proposal.signature = self.sign(proposal.height, proposal.round, SignStep::Propose, sign_bytes)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PrivValidatorError {
    #[error("refusing to sign for {height}/{round}: already signed for {last_height}/{last_round}")]
    Regression {
        height: Height,
        round: Round,
        last_height: Height,
        last_round: Round,
    },
    #[error("refusing to sign different data for the same step at {height}/{round}")]
    Conflicting { height: Height, round: Round },
    #[error("cannot access sign state file {}: {source}", path.display())]
    StateFile { path: PathBuf, source: io::Error },
    #[error("sign state file {} is not valid: {source}", path.display())]
    CorruptStateFile { path: PathBuf, source: serde_json::Error },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::crypto_primitives::verify;

    fn prevote(pv: &LocalPrivValidator, height: u64, round: u32) -> Vote {
        Vote::new(pv.address(), 0, Height::new(height), Round::new(round), VoteType::Prevote, None)
    }

    #[test]
    fn signs_and_verifies() {
        let chain_id = ChainID::new("test");
        let mut pv = LocalPrivValidator::generate();
        let mut vote = prevote(&pv, 1, 0);
        pv.sign_vote(&chain_id, &mut vote).unwrap();
        assert!(verify(&pv.pub_key(), &vote.sign_bytes(&chain_id), &vote.signature));
    }

    #[test]
    fn refuses_to_go_backwards() {
        let chain_id = ChainID::new("test");
        let mut pv = LocalPrivValidator::generate();
        let mut later = prevote(&pv, 2, 1);
        pv.sign_vote(&chain_id, &mut later).unwrap();

        let mut earlier = prevote(&pv, 2, 0);
        assert!(matches!(
            pv.sign_vote(&chain_id, &mut earlier),
            Err(PrivValidatorError::Regression { .. })
        ));
    }

    #[test]
    fn same_step_returns_same_signature_only_for_same_bytes() {
        let chain_id = ChainID::new("test");
        let mut pv = LocalPrivValidator::generate();
        let mut first = prevote(&pv, 1, 0);
        pv.sign_vote(&chain_id, &mut first).unwrap();

        let mut again = prevote(&pv, 1, 0);
        pv.sign_vote(&chain_id, &mut again).unwrap();
        assert_eq!(again.signature, first.signature);

        let mut conflicting = prevote(&pv, 1, 0);
        conflicting.validator_index = 7;
        assert!(matches!(
            pv.sign_vote(&chain_id, &mut conflicting),
            Err(PrivValidatorError::Conflicting { height, round }) if height == Height::new(1) && round == Round::new(0)
        ));
    }

    #[test]
    fn guard_survives_rebuilding_from_state_file() {
        let chain_id = ChainID::new("test");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priv_validator_state.json");
        let key = || Keypair::new(SigningKey::from_bytes(&[3u8; 32]));

        let mut pv = LocalPrivValidator::with_state_file(key(), &path).unwrap();
        let mut first = prevote(&pv, 5, 0);
        pv.sign_vote(&chain_id, &mut first).unwrap();
        drop(pv);
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let mut pv = LocalPrivValidator::with_state_file(key(), &path).unwrap();
        let mut conflicting = prevote(&pv, 5, 0);
        conflicting.validator_index = 1;
        assert!(matches!(
            pv.sign_vote(&chain_id, &mut conflicting),
            Err(PrivValidatorError::Conflicting { .. })
        ));

        let mut earlier = prevote(&pv, 4, 3);
        assert!(matches!(
            pv.sign_vote(&chain_id, &mut earlier),
            Err(PrivValidatorError::Regression { .. })
        ));

        let mut same = prevote(&pv, 5, 0);
        pv.sign_vote(&chain_id, &mut same).unwrap();
        assert_eq!(same.signature, first.signature);
    }

    #[test]
    fn memory_only_validator_forgets_on_rebuild() {
        let chain_id = ChainID::new("test");
        let key = || Keypair::new(SigningKey::from_bytes(&[4u8; 32]));

        let mut pv = LocalPrivValidator::new(key());
        let mut first = prevote(&pv, 5, 0);
        pv.sign_vote(&chain_id, &mut first).unwrap();

        let mut pv = LocalPrivValidator::new(key());
        let mut conflicting = prevote(&pv, 5, 0);
        conflicting.validator_index = 1;
        assert!(pv.sign_vote(&chain_id, &mut conflicting).is_ok());
    }

    #[test]
    fn corrupt_state_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("priv_validator_state.json");
        fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            LocalPrivValidator::with_state_file(Keypair::new(SigningKey::from_bytes(&[5u8; 32])), &path),
            Err(PrivValidatorError::CorruptStateFile { .. })
        ));
    }
}
