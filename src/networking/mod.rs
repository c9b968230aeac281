/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The pluggable peer-to-peer transport, and the threads that move consensus messages between it and the
//! round state machine.

pub mod network;
pub use network::{Network, PeerKey};

pub(crate) mod receiving;
pub(crate) use receiving::start_polling;

pub(crate) mod sending;
pub(crate) use sending::BroadcastPool;
