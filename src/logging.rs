/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Log targets handed to components, and functions that log out events.
//!
//! Angine logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages printed onto a
//! terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log handles
//!
//! Every component receives a [`LogHandle`] when it is constructed, and logs with the handle's target. A
//! node's handles all descend from the one in its [configuration](crate::node::Configuration), so that
//! the logs of several nodes running in one process can be told apart.
//!
//! ## Event log format
//!
//! If the user enabled them via the node's [configuration](crate::node::Configuration), events are logged
//! as CSVs (Comma Separated Values) with at least two values. The first two values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following snippet is how
//! a [Lock](crate::events::LockEvent) is printed:
//!
//! ```text
//! Lock, 1701329264, 12, 0, fNGCJyk
//! ```
//!
//! In the snippet, the third and fourth values are the height and round of the lock, and the fifth value
//! is the first seven characters of the Base64 encoding of the hash of the locked block.

use std::{sync::Arc, time::SystemTime};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

use crate::events::*;

/// A cloneable log target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHandle {
    target: Arc<str>,
}

impl LogHandle {
    pub fn new(target: impl AsRef<str>) -> LogHandle {
        LogHandle {
            target: Arc::from(target.as_ref()),
        }
    }

    /// A handle for a sub-component, whose target is `<this target>::<component>`.
    pub fn child(&self, component: &str) -> LogHandle {
        LogHandle::new(format!("{}::{}", self.target, component))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for LogHandle {
    fn default() -> Self {
        LogHandle::new("angine")
    }
}

// Names of each event in PascalCase for printing:
pub const NEW_ROUND_STEP: &str = "NewRoundStep";
pub const NEW_ROUND: &str = "NewRound";
pub const COMPLETE_PROPOSAL: &str = "CompleteProposal";
pub const POLKA: &str = "Polka";
pub const LOCK: &str = "Lock";
pub const UNLOCK: &str = "Unlock";
pub const RELOCK: &str = "Relock";
pub const TIMEOUT_PROPOSE: &str = "TimeoutPropose";
pub const TIMEOUT_WAIT: &str = "TimeoutWait";
pub const VOTE: &str = "Vote";
pub const NEW_BLOCK: &str = "NewBlock";
pub const NEW_BLOCK_HEADER: &str = "NewBlockHeader";
pub const TX: &str = "Tx";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for NewRoundStepEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &NewRoundStepEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND_STEP,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                event.step
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewRoundEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &NewRoundEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                event
                    .proposer
                    .map(|proposer| first_seven_base64_chars(&proposer.bytes()))
                    .unwrap_or_else(|| "none".to_string())
            )
        };
        Box::new(logger)
    }
}

impl Logger for CompleteProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &CompleteProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMPLETE_PROPOSAL,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                first_seven_base64_chars(&event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PolkaEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &PolkaEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                POLKA,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                block_or_nil(&event.block)
            )
        };
        Box::new(logger)
    }
}

impl Logger for LockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &LockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                LOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                first_seven_base64_chars(&event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UnlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &UnlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UNLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for RelockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &RelockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RELOCK,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                first_seven_base64_chars(&event.block.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &TimeoutProposeEvent| {
            log::info!(
                "{}, {}, {}, {}",
                TIMEOUT_PROPOSE,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutWaitEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &TimeoutWaitEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                TIMEOUT_WAIT,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                event.round,
                event.step
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {:?}, {}",
                VOTE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.vote.validator_address.bytes()),
                event.vote.height,
                event.vote.round,
                event.vote.vote_type,
                block_or_nil(&event.vote.block_id.map(|block_id| block_id.hash))
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &NewBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                event.block.header.height,
                first_seven_base64_chars(&event.block.hash().bytes()),
                event.block.data.txs.len()
            )
        };
        Box::new(logger)
    }
}

impl Logger for NewBlockHeaderEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &NewBlockHeaderEvent| {
            log::info!(
                "{}, {}, {}, {}",
                NEW_BLOCK_HEADER,
                secs_since_unix_epoch(event.timestamp),
                event.header.height,
                first_seven_base64_chars(&event.header.app_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for TxEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |event: &TxEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                TX,
                secs_since_unix_epoch(event.timestamp),
                event.height,
                first_seven_base64_chars(&event.tx.bytes()),
                event.valid
            )
        };
        Box::new(logger)
    }
}

fn block_or_nil(block: &Option<crate::types::data_types::CryptoHash>) -> String {
    match block {
        Some(hash) => first_seven_base64_chars(&hash.bytes()),
        None => "nil".to_string(),
    }
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_handles_extend_target() {
        let node = LogHandle::new("angine::node-0");
        assert_eq!(node.child("wal").target(), "angine::node-0::wal");
    }

    #[test]
    fn short_hashes_are_seven_chars() {
        assert_eq!(first_seven_base64_chars(&[0u8; 32]), "AAAAAAA");
        assert_eq!(first_seven_base64_chars(&[0u8; 3]), "AAAA");
    }
}
