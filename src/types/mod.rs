/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and traits that are used across multiple components of angine.
//!
//! Types specific to single components, e.g. WAL records, can be found in those components' modules, e.g.,
//! [`crate::consensus::wal`].

pub mod block;

pub mod crypto_primitives;

pub mod data_types;

pub mod genesis;

pub mod part_set;

pub mod priv_validator;

pub mod validators;

pub mod vote;

pub mod vote_set;
