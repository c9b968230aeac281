/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that exist only to store bytes or numbers, and do not have any major "active" behavior.
//!
//! Byte newtypes are encoded with [borsh] when persisted in the key-value store, and with [serde] as
//! Base64 strings when they appear in the consensus write-ahead log or in a genesis document.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use super::crypto_primitives::{CryptoHasher, Digest};

/// String that uniquely identifies a blockchain.
///
/// Every block, vote, and proposal of a chain carries (or signs over) the same `ChainID`.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct ChainID(String);

impl ChainID {
    /// Create a new `ChainID` from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string value of this `ChainID`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChainID {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Height of a block in the chain.
///
/// Height 0 is the (block-less) genesis state; the first block has height 1.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Height(u64);

impl Height {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// Get the little-endian representation of this `Height`, used to build storage keys.
    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl Display for Height {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for Height {
    type Output = Height;
    fn add(self, rhs: u64) -> Self::Output {
        Height(self.0 + rhs)
    }
}

impl AddAssign<u64> for Height {
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs
    }
}

impl Sub<u64> for Height {
    type Output = Height;
    fn sub(self, rhs: u64) -> Self::Output {
        Height(self.0.saturating_sub(rhs))
    }
}

/// Round number within a height. Resets to 0 at every new height.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Round(u32);

impl Round {
    pub const fn new(int: u32) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u32 {
        self.0
    }

    pub const fn next(&self) -> Round {
        Round(self.0 + 1)
    }
}

impl Display for Round {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Sub<Round> for Round {
    type Output = u32;
    fn sub(self, rhs: Round) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Voting power of a single validator.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Power(u64);

impl Power {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

/// Sum of the voting powers of a group of validators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct TotalPower(u128);

impl TotalPower {
    pub const fn new(int: u128) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u128 {
        self.0
    }
}

impl AddAssign<Power> for TotalPower {
    fn add_assign(&mut self, rhs: Power) {
        self.0 += rhs.0 as u128
    }
}

impl Display for TotalPower {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Implements `Serialize` and `Deserialize` for a fixed-size byte newtype by encoding it as a Base64
/// string.
macro_rules! impl_base64_serde {
    ($name:ident, $len:expr) => {
        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&STANDARD.encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let encoded = <String as Deserialize>::deserialize(deserializer)?;
                let decoded = STANDARD.decode(encoded).map_err(de::Error::custom)?;
                let bytes: [u8; $len] = decoded
                    .try_into()
                    .map_err(|v: Vec<u8>| de::Error::invalid_length(v.len(), &stringify!($len)))?;
                Ok($name(bytes))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                f.write_str(&STANDARD.encode(self.0))
            }
        }
    };
}

/// 32-byte cryptographic hash. Within angine, always a SHA256 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct CryptoHash([u8; 32]);

impl CryptoHash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Whether every byte of this hash is zero. Zero hashes stand in for "absent" app and receipts
    /// hashes in a genesis document.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// SHA256 hash of `data`.
    pub fn digest(data: &[u8]) -> CryptoHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(data);
        CryptoHash(hasher.finalize().into())
    }
}

impl_base64_serde!(CryptoHash, 32);

/// Ed25519 digital signature.
#[derive(Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl_base64_serde!(SignatureBytes, 64);

/// Bytes of an Ed25519 verifying key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub struct PublicKeyBytes([u8; 32]);

impl PublicKeyBytes {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// The [`Address`] of the validator that owns this key.
    pub fn address(&self) -> Address {
        let digest = CryptoHash::digest(&self.0).bytes();
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[..20]);
        Address(address)
    }
}

impl_base64_serde!(PublicKeyBytes, 32);

/// 20-byte validator address: the first 20 bytes of the SHA256 hash of the validator's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, BorshSerialize, BorshDeserialize)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 20] {
        self.0
    }
}

impl_base64_serde!(Address, 20);

/// A single opaque transaction.
#[derive(Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Tx(#[serde(with = "base64_bytes")] Vec<u8>);

impl Tx {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn hash(&self) -> CryptoHash {
        CryptoHash::digest(&self.0)
    }
}

impl Debug for Tx {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tx({})", self.hash())
    }
}

/// Milliseconds since the Unix Epoch.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Serde adapter that encodes a `Vec<u8>` as a Base64 string.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_hash_serializes_as_base64() {
        let hash = CryptoHash::digest(b"angine");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", STANDARD.encode(hash.bytes())));
        assert_eq!(serde_json::from_str::<CryptoHash>(&json).unwrap(), hash);
    }

    #[test]
    fn wrong_length_signature_is_rejected() {
        let json = format!("\"{}\"", STANDARD.encode([1u8; 63]));
        assert!(serde_json::from_str::<SignatureBytes>(&json).is_err());
    }

    #[test]
    fn address_is_prefix_of_key_hash() {
        let key = PublicKeyBytes::new([7u8; 32]);
        let digest = CryptoHash::digest(&[7u8; 32]).bytes();
        assert_eq!(key.address().bytes(), digest[..20]);
    }
}
