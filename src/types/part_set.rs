/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Splitting blocks into fixed-size parts for gossip, and reassembling them.
//!
//! The parts of a block are authenticated by a binary Merkle tree over their hashes. A proposal carries
//! only the root (in the [`PartSetHeader`]); each [`Part`] carries the proof that links it to the root,
//! so a part can be verified the moment it is received.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::data_types::{base64_bytes, CryptoHash};

/// Identifies a complete set of parts: how many there are, and the Merkle root over them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: CryptoHash,
}

/// A single chunk of an encoded block.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    /// Sibling hashes from the leaf up to (but excluding) the root.
    pub proof: Vec<CryptoHash>,
}

/// A possibly incomplete collection of the parts described by a [`PartSetHeader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    /// Split `data` into parts of at most `part_size` bytes.
    pub fn from_data(data: &[u8], part_size: usize) -> PartSet {
        let part_size = part_size.max(1);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(part_size).collect()
        };
        let leaves: Vec<CryptoHash> = chunks.iter().map(|chunk| leaf_hash(chunk)).collect();
        let root = merkle_root(&leaves);

        let parts: Vec<Option<Part>> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                Some(Part {
                    index: index as u32,
                    bytes: chunk.to_vec(),
                    proof: merkle_proof(&leaves, index),
                })
            })
            .collect();
        let total = parts.len() as u32;

        PartSet {
            header: PartSetHeader { total, hash: root },
            parts,
            count: total,
        }
    }

    /// Create an empty part set that expects the parts described by `header`. Headers from peers are
    /// untrusted, so a `total` of zero or above `max_total` is refused before anything is allocated.
    pub fn from_header(header: PartSetHeader, max_total: u32) -> Result<PartSet, PartSetError> {
        if header.total == 0 || header.total > max_total {
            return Err(PartSetError::InvalidTotal {
                total: header.total,
                max: max_total,
            });
        }
        Ok(PartSet {
            header,
            parts: vec![None; header.total as usize],
            count: 0,
        })
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    pub fn has_header(&self, header: &PartSetHeader) -> bool {
        &self.header == header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn get_part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|part| part.as_ref())
    }

    /// Add `part` to the set. Returns `Ok(false)` if the part was already present.
    ///
    /// Parts received from peers are checked against the Merkle root; parts that this replica produced
    /// itself can skip the check by passing `verify = false`.
    pub fn add_part(&mut self, part: Part, verify: bool) -> Result<bool, PartSetError> {
        let index = part.index as usize;
        if index >= self.parts.len() {
            return Err(PartSetError::UnexpectedIndex {
                index: part.index,
                total: self.header.total,
            });
        }
        if self.parts[index].is_some() {
            return Ok(false);
        }
        if verify {
            let root = compute_root(leaf_hash(&part.bytes), index, self.parts.len(), &part.proof);
            if root != Some(self.header.hash) {
                return Err(PartSetError::InvalidProof { index: part.index });
            }
        }
        self.parts[index] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate the bytes of every part. Fails if the set is not yet complete.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        let mut data = Vec::new();
        for part in &self.parts {
            match part {
                Some(part) => data.extend_from_slice(&part.bytes),
                None => {
                    return Err(PartSetError::Incomplete {
                        count: self.count,
                        total: self.header.total,
                    })
                }
            }
        }
        Ok(data)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartSetError {
    #[error("part set of {total} parts is not allowed, the limit is {max}")]
    InvalidTotal { total: u32, max: u32 },
    #[error("part index {index} is out of range for a set of {total} parts")]
    UnexpectedIndex { index: u32, total: u32 },
    #[error("part {index} does not hash to the part set root")]
    InvalidProof { index: u32 },
    #[error("part set has {count} of {total} parts")]
    Incomplete { count: u32, total: u32 },
}

fn leaf_hash(bytes: &[u8]) -> CryptoHash {
    let mut data = Vec::with_capacity(bytes.len() + 1);
    data.push(0u8);
    data.extend_from_slice(bytes);
    CryptoHash::digest(&data)
}

fn inner_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut data = Vec::with_capacity(65);
    data.push(1u8);
    data.extend_from_slice(&left.bytes());
    data.extend_from_slice(&right.bytes());
    CryptoHash::digest(&data)
}

/// Largest power of two strictly less than `n`. `n` must be at least 2.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

fn merkle_root(leaves: &[CryptoHash]) -> CryptoHash {
    match leaves.len() {
        0 => CryptoHash::digest(&[]),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            inner_hash(&merkle_root(&leaves[..k]), &merkle_root(&leaves[k..]))
        }
    }
}

fn merkle_proof(leaves: &[CryptoHash], index: usize) -> Vec<CryptoHash> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut proof = merkle_proof(&leaves[..k], index);
        proof.push(merkle_root(&leaves[k..]));
        proof
    } else {
        let mut proof = merkle_proof(&leaves[k..], index - k);
        proof.push(merkle_root(&leaves[..k]));
        proof
    }
}

fn compute_root(leaf: CryptoHash, index: usize, total: usize, proof: &[CryptoHash]) -> Option<CryptoHash> {
    if total == 0 {
        return None;
    }
    if total == 1 {
        return proof.is_empty().then_some(leaf);
    }
    let (sibling, rest) = proof.split_last()?;
    let k = split_point(total);
    if index < k {
        let left = compute_root(leaf, index, k, rest)?;
        Some(inner_hash(&left, sibling))
    } else {
        let right = compute_root(leaf, index - k, total - k, rest)?;
        Some(inner_hash(sibling, &right))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_from_peer_reassemble_into_original() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let source = PartSet::from_data(&data, 64);
        assert_eq!(source.total(), 16);

        let mut sink = PartSet::from_header(source.header(), 64).unwrap();
        for index in (0..source.total()).rev() {
            let part = source.get_part(index).unwrap().clone();
            assert_eq!(sink.add_part(part, true), Ok(true));
        }
        assert!(sink.is_complete());
        assert_eq!(sink.assemble().unwrap(), data);
    }

    #[test]
    fn tampered_part_is_rejected() {
        let source = PartSet::from_data(&[9u8; 300], 100);
        let mut sink = PartSet::from_header(source.header(), 64).unwrap();

        let mut part = source.get_part(1).unwrap().clone();
        part.bytes[0] ^= 0xff;
        assert_eq!(sink.add_part(part, true), Err(PartSetError::InvalidProof { index: 1 }));
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn duplicate_part_is_not_added_twice() {
        let source = PartSet::from_data(&[1u8; 10], 4);
        let mut sink = PartSet::from_header(source.header(), 64).unwrap();
        let part = source.get_part(0).unwrap().clone();
        assert_eq!(sink.add_part(part.clone(), true), Ok(true));
        assert_eq!(sink.add_part(part, true), Ok(false));
        assert!(sink.assemble().is_err());
    }

    #[test]
    fn oversized_header_is_refused() {
        let hash = CryptoHash::digest(b"block");
        assert_eq!(
            PartSet::from_header(PartSetHeader { total: u32::MAX, hash }, 336),
            Err(PartSetError::InvalidTotal { total: u32::MAX, max: 336 })
        );
        assert_eq!(
            PartSet::from_header(PartSetHeader { total: 0, hash }, 336),
            Err(PartSetError::InvalidTotal { total: 0, max: 336 })
        );

        let parts = PartSet::from_header(PartSetHeader { total: 336, hash }, 336).unwrap();
        assert_eq!((parts.total(), parts.count()), (336, 0));
    }
}
