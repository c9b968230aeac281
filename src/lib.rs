/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A round-based BFT consensus core in the style of Tendermint.
//!
//! Angine drives a replica through heights and rounds of propose, prevote, and precommit. It owns the
//! parts of a replica that decide and persist blocks:
//! - The [round state machine](consensus::state), with its [timeout ticker](consensus::ticker) and
//!   [write-ahead log](consensus::wal), which together let a crashed replica resume where it stopped.
//! - The [state](state) pipeline, which executes and commits blocks through the application's
//!   [hooks], and reconciles the state with the [block store](block_store) on start.
//!
//! Transport, storage, transaction admission, and the application itself are pluggable: see
//! [`Network`](networking::Network), [`KVStore`](state::kv_store::KVStore), [`Mempool`](mempool::Mempool),
//! and [`Hooks`](hooks::Hooks). A [`Node`](node::Node) wires them together.

pub mod block_store;

pub mod consensus;

pub mod error;

pub mod event_bus;

pub mod events;

pub mod hooks;

pub mod logging;

pub mod mempool;

pub mod networking;

pub mod node;

pub mod service;

pub mod state;

pub mod types;
