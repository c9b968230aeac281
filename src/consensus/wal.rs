/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus write-ahead log.
//!
//! Every step transition, every message the round state machine handles, and every timeout it acts on is
//! appended to `<wal_dir>/wal` (and flushed to disk) before the state machine acts on it. After a crash,
//! replaying the records that follow the current height's checkpoint through the state machine
//! deterministically brings it back to where it was.
//!
//! ## File format
//!
//! The file is a sequence of lines, each of which is either:
//! - A height checkpoint, `#HEIGHT: <n>`, written before the first record of height `n`.
//! - A JSON record, `{"time": <millis>, "msg": {"type": "RoundState" | "MsgInfo" | "Timeout", "data": ...}}`.
//!
//! A freshly created log starts with `#HEIGHT: 1`.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    messages::MsgInfo,
    round_state::{RoundStateRecord, RoundStepType, TimeoutInfo},
};
use crate::{
    error::{HasSeverity, Severity},
    logging::LogHandle,
    service::{Service, ServiceError, ServiceState},
    types::data_types::{now_millis, Height, Timestamp},
};

const HEIGHT_PREFIX: &str = "#HEIGHT: ";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WALMessage {
    RoundState(RoundStateRecord),
    MsgInfo(MsgInfo),
    Timeout(TimeoutInfo),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimedWALMessage {
    pub time: Timestamp,
    pub msg: WALMessage,
}

/// A parsed line of the log file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WALLine {
    Height(Height),
    Record(TimedWALMessage),
}

pub struct Wal {
    state: ServiceState,
    log: LogHandle,
    path: PathBuf,
    light: bool,
    file: Option<File>,
}

impl Wal {
    /// Create a stopped WAL that will write to `<wal_dir>/wal`. In `light` mode, messages received from peers
    /// are not persisted.
    pub fn new(log: LogHandle, wal_dir: impl AsRef<Path>, light: bool) -> Wal {
        Wal {
            state: ServiceState::default(),
            log,
            path: wal_dir.as_ref().join("wal"),
            light,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `msg` and sync it to disk.
    pub fn save(&mut self, msg: &WALMessage) -> Result<(), WalError> {
        if self.light {
            if let WALMessage::MsgInfo(msg_info) = msg {
                if !msg_info.is_own() {
                    return Ok(());
                }
            }
        }

        if let WALMessage::RoundState(record) = msg {
            if record.step == RoundStepType::NewHeight {
                self.write_height(record.height)?;
            }
        }

        let timed = TimedWALMessage {
            time: now_millis(),
            msg: msg.clone(),
        };
        let line = serde_json::to_string(&timed).map_err(WalError::Encode)?;
        self.write_line(&line)
    }

    fn write_height(&mut self, height: Height) -> Result<(), WalError> {
        log::debug!(target: self.log.target(), "writing checkpoint for height {}", height);
        self.write_line(&format!("{}{}", HEIGHT_PREFIX, height))
    }

    fn write_line(&mut self, line: &str) -> Result<(), WalError> {
        let file = self.file.as_mut().ok_or(WalError::NotRunning)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// The records that follow the `#HEIGHT: height` checkpoint, up to the end of the log. `None` if the
    /// checkpoint is not in the log.
    pub fn search_height(&self, height: Height) -> Result<Option<Vec<TimedWALMessage>>, WalError> {
        let lines = self.read_all()?;
        let Some(checkpoint) = lines.iter().position(|line| *line == WALLine::Height(height)) else {
            return Ok(None);
        };
        let records = lines
            .into_iter()
            .skip(checkpoint + 1)
            .filter_map(|line| match line {
                WALLine::Record(record) => Some(record),
                WALLine::Height(_) => None,
            })
            .collect();
        Ok(Some(records))
    }

    /// Parse every line of the log.
    ///
    /// A final line that does not parse is a write torn by a crash, and is skipped. A line that does not
    /// parse anywhere else is a [`WalError::Decode`].
    pub fn read_all(&self) -> Result<Vec<WALLine>, WalError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let raw_lines = BufReader::new(file).lines().collect::<Result<Vec<String>, _>>()?;
        let last = raw_lines.len().saturating_sub(1);

        let mut lines = Vec::with_capacity(raw_lines.len());
        for (index, raw) in raw_lines.iter().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match parse_line(raw) {
                Ok(line) => lines.push(line),
                Err(reason) if index == last => {
                    log::warn!(target: self.log.target(), "ignoring torn final line of {}: {}", self.path.display(), reason);
                }
                Err(reason) => {
                    return Err(WalError::Decode {
                        line: index + 1,
                        reason,
                    })
                }
            }
        }
        Ok(lines)
    }
}

fn parse_line(raw: &str) -> Result<WALLine, String> {
    if let Some(height) = raw.strip_prefix(HEIGHT_PREFIX) {
        return height
            .trim()
            .parse::<u64>()
            .map(|height| WALLine::Height(Height::new(height)))
            .map_err(|err| err.to_string());
    }
    serde_json::from_str::<TimedWALMessage>(raw)
        .map(WALLine::Record)
        .map_err(|err| err.to_string())
}

impl Service for Wal {
    fn name(&self) -> &'static str {
        "wal"
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        self.state.start(self.name())?;
        let open = || -> Result<File, std::io::Error> {
            if let Some(dir) = self.path.parent() {
                fs::create_dir_all(dir)?;
            }
            OpenOptions::new().create(true).append(true).open(&self.path)
        };
        let file = match open() {
            Ok(file) => file,
            Err(err) => {
                self.state = ServiceState::Stopped;
                return Err(ServiceError::StartFailed {
                    name: self.name(),
                    reason: err.to_string(),
                });
            }
        };
        let is_empty = file.metadata().map(|metadata| metadata.len() == 0).unwrap_or(false);
        self.file = Some(file);

        if is_empty {
            if let Err(err) = self.write_height(Height::new(1)) {
                self.file = None;
                self.state = ServiceState::Stopped;
                return Err(ServiceError::StartFailed {
                    name: self.name(),
                    reason: err.to_string(),
                });
            }
        }
        log::info!(target: self.log.target(), "opened {}", self.path.display());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ServiceError> {
        self.state.stop(self.name())?;
        if let Some(file) = self.file.take() {
            let _ = file.sync_all();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

#[derive(Debug, Error)]
pub enum WalError {
    #[error("write-ahead log is not running")]
    NotRunning,
    #[error("write-ahead log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot encode write-ahead log record: {0}")]
    Encode(serde_json::Error),
    #[error("corrupt write-ahead log record on line {line}: {reason}")]
    Decode { line: usize, reason: String },
}

impl HasSeverity for WalError {
    fn severity(&self) -> Severity {
        match self {
            WalError::NotRunning => Severity::Sanity,
            WalError::Io(_) | WalError::Encode(_) | WalError::Decode { .. } => Severity::Crisis,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::data_types::Round;

    fn round_state(height: u64, round: u32, step: RoundStepType) -> WALMessage {
        WALMessage::RoundState(RoundStateRecord {
            height: Height::new(height),
            round: Round::new(round),
            step,
        })
    }

    fn open(dir: &Path, light: bool) -> Wal {
        let mut wal = Wal::new(LogHandle::new("wal"), dir, light);
        wal.start().unwrap();
        wal
    }

    #[test]
    fn fresh_log_starts_with_height_one() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open(dir.path(), false);
        assert_eq!(wal.read_all().unwrap(), vec![WALLine::Height(Height::new(1))]);
        assert_eq!(wal.search_height(Height::new(1)).unwrap(), Some(Vec::new()));
        assert_eq!(wal.search_height(Height::new(2)).unwrap(), None);
    }

    #[test]
    fn checkpoint_precedes_new_height_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open(dir.path(), false);
        wal.save(&round_state(1, 0, RoundStepType::Propose)).unwrap();
        wal.save(&round_state(2, 0, RoundStepType::NewHeight)).unwrap();
        let timeout = WALMessage::Timeout(TimeoutInfo {
            duration: Duration::from_millis(1000),
            height: Height::new(2),
            round: Round::new(0),
            step: RoundStepType::NewHeight,
        });
        wal.save(&timeout).unwrap();

        let lines = wal.read_all().unwrap();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], WALLine::Height(Height::new(2)));
        assert!(matches!(&lines[3], WALLine::Record(r) if r.msg == round_state(2, 0, RoundStepType::NewHeight)));

        let after_two: Vec<WALMessage> = wal
            .search_height(Height::new(2))
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|record| record.msg)
            .collect();
        assert_eq!(after_two, vec![round_state(2, 0, RoundStepType::NewHeight), timeout]);
    }

    #[test]
    fn records_use_type_discriminant() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open(dir.path(), false);
        wal.save(&round_state(1, 0, RoundStepType::NewRound)).unwrap();
        let contents = fs::read_to_string(wal.path()).unwrap();
        let record = contents.lines().nth(1).unwrap();
        let json: serde_json::Value = serde_json::from_str(record).unwrap();
        assert_eq!(json["msg"]["type"], "RoundState");
        assert_eq!(json["msg"]["data"]["step"], "NewRound");
    }

    #[test]
    fn torn_final_line_is_ignored_but_corrupt_middle_line_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open(dir.path(), false);
        wal.save(&round_state(1, 0, RoundStepType::NewRound)).unwrap();
        wal.stop().unwrap();

        let mut file = OpenOptions::new().append(true).open(wal.path()).unwrap();
        file.write_all(b"{\"time\": 12, \"msg\"").unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 2);

        file.write_all(b"\n#HEIGHT: 2\n").unwrap();
        assert!(matches!(wal.read_all(), Err(WalError::Decode { line: 3, .. })));
    }

    #[test]
    fn restart_appends_without_new_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open(dir.path(), false);
        wal.save(&round_state(1, 0, RoundStepType::NewRound)).unwrap();
        wal.stop().unwrap();
        assert!(matches!(wal.save(&round_state(1, 0, RoundStepType::Propose)), Err(WalError::NotRunning)));

        wal.start().unwrap();
        wal.save(&round_state(1, 0, RoundStepType::Propose)).unwrap();
        let lines = wal.read_all().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.iter().filter(|line| matches!(line, WALLine::Height(_))).count(), 1);
    }
}
