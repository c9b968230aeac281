/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Crash recovery for the round state machine.
//!
//! On start, the records that the write-ahead log holds after the current height's `#HEIGHT` checkpoint are
//! fed back into the state machine in replay mode. Replay does not write to the log, sign, or broadcast,
//! and the messages the state machine would have queued for itself are dropped: the log already holds the
//! ones that were handled before the crash.

use super::{
    round_state::RoundStepType,
    state::ConsensusState,
    wal::{TimedWALMessage, WALMessage},
    ConsensusError,
};
use crate::{mempool::Mempool, state::kv_store::KVStore, types::data_types::Height};

impl<K: KVStore, M: Mempool> ConsensusState<K, M> {
    /// Replay the log records of `height`. A log without a checkpoint for `height` has nothing to replay.
    pub(super) fn catchup_replay(&mut self, height: Height) -> Result<(), ConsensusError> {
        let Some(records) = self.wal.search_height(height)? else {
            log::info!(target: self.log.target(), "nothing to replay for height {}", height);
            return Ok(());
        };
        log::info!(target: self.log.target(), "replaying {} records of height {}", records.len(), height);

        self.replay_mode = true;
        let result = self.replay_records(records);
        self.replay_mode = false;
        self.clear_internal_queue();

        if result.is_ok() {
            log::info!(
                target: self.log.target(),
                "replay done at height {}, round {}, step {}",
                self.rs.height,
                self.rs.round,
                self.rs.step
            );
        }
        result
    }

    fn replay_records(&mut self, records: Vec<TimedWALMessage>) -> Result<(), ConsensusError> {
        for record in records {
            match record.msg {
                WALMessage::RoundState(round_state) => {
                    log::debug!(target: self.log.target(), "replay: was at {}/{}/{}", round_state.height, round_state.round, round_state.step);
                }
                WALMessage::MsgInfo(msg_info) => self.handle_msg(msg_info)?,
                WALMessage::Timeout(ti) => self.handle_timeout(ti)?,
            }
        }
        Ok(())
    }

    /// Write a `#HEIGHT` checkpoint for the current height if the log lacks one, which happens if the
    /// replica stopped between committing a block and logging the new height.
    pub(super) fn ensure_height_checkpoint(&mut self) -> Result<(), ConsensusError> {
        if self.rs.step != RoundStepType::NewHeight {
            return Ok(());
        }
        if self.wal.search_height(self.rs.height)?.is_none() {
            log::info!(target: self.log.target(), "writing missing checkpoint for height {}", self.rs.height);
            self.wal.save(&WALMessage::RoundState(self.rs.record()))?;
        }
        Ok(())
    }
}
