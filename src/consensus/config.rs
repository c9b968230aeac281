/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Parameters of the round state machine.

use std::{path::PathBuf, time::Duration};

use crate::types::data_types::{Round, Timestamp};

/// Largest encoded block, in bytes, that a replica will allocate parts for.
pub const MAX_BLOCK_BYTES: usize = 22_020_096;

/// How long to wait in each step of a round. Every timeout but `commit0` grows linearly with the round
/// number, so that replicas that disagree on timing eventually spend long enough in the same round to
/// decide.
///
/// All values are in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutParams {
    pub propose0: u64,
    pub propose_delta: u64,
    pub prevote0: u64,
    pub prevote_delta: u64,
    pub precommit0: u64,
    pub precommit_delta: u64,
    pub commit0: u64,
    /// Start the next height as soon as precommits from every validator are in, instead of waiting out
    /// `commit0`.
    pub skip_timeout_commit: bool,
}

impl Default for TimeoutParams {
    fn default() -> Self {
        TimeoutParams {
            propose0: 3000,
            propose_delta: 500,
            prevote0: 1000,
            prevote_delta: 500,
            precommit0: 1000,
            precommit_delta: 500,
            commit0: 1000,
            skip_timeout_commit: false,
        }
    }
}

impl TimeoutParams {
    /// How long to wait for a proposal.
    pub fn propose(&self, round: Round) -> Duration {
        Duration::from_millis(self.propose0 + self.propose_delta * round.int() as u64)
    }

    /// How long to wait for straggling prevotes after +2/3 of any prevotes.
    pub fn prevote(&self, round: Round) -> Duration {
        Duration::from_millis(self.prevote0 + self.prevote_delta * round.int() as u64)
    }

    /// How long to wait for straggling precommits after +2/3 of any precommits.
    pub fn precommit(&self, round: Round) -> Duration {
        Duration::from_millis(self.precommit0 + self.precommit_delta * round.int() as u64)
    }

    /// When the next height starts, given the time the current height was committed.
    pub fn commit(&self, commit_time: Timestamp) -> Timestamp {
        commit_time + self.commit0
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub timeouts: TimeoutParams,
    /// Directory that holds the write-ahead log file.
    pub wal_dir: PathBuf,
    /// Do not persist messages received from peers in the write-ahead log.
    pub wal_light: bool,
    /// Maximum number of transactions reaped from the mempool into a proposal.
    pub block_size: usize,
    /// Size in bytes of the parts that proposed blocks are split into.
    pub block_part_size: usize,
    /// Maximum number of peer messages for future heights (or proposals for future rounds) held back
    /// until the replica catches up with them.
    pub future_msg_buffer_capacity: usize,
}

impl ConsensusConfig {
    /// The most parts a block of at most [`MAX_BLOCK_BYTES`] can be split into.
    pub fn max_block_parts(&self) -> u32 {
        let parts = MAX_BLOCK_BYTES.div_ceil(self.block_part_size.max(1));
        u32::try_from(parts).unwrap_or(u32::MAX)
    }
}
