/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`Service`] trait, implemented by every long-lived component that owns a thread or a file.
//!
//! Services share the same lifecycle, tracked by an embedded [`ServiceState`]:
//!
//! ```text
//! Stopped --start()--> Running --stop()--> Stopped
//! ```
//!
//! Starting a running service, or stopping a stopped one, is an error.

use thiserror::Error;

use crate::error::{HasSeverity, Severity};

pub trait Service {
    fn name(&self) -> &'static str;

    fn start(&mut self) -> Result<(), ServiceError>;

    fn stop(&mut self) -> Result<(), ServiceError>;

    fn is_running(&self) -> bool;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceState {
    #[default]
    Stopped,
    Running,
}

impl ServiceState {
    /// Move from `Stopped` to `Running`.
    pub fn start(&mut self, name: &'static str) -> Result<(), ServiceError> {
        match self {
            ServiceState::Stopped => {
                *self = ServiceState::Running;
                Ok(())
            }
            ServiceState::Running => Err(ServiceError::AlreadyRunning { name }),
        }
    }

    /// Move from `Running` to `Stopped`.
    pub fn stop(&mut self, name: &'static str) -> Result<(), ServiceError> {
        match self {
            ServiceState::Running => {
                *self = ServiceState::Stopped;
                Ok(())
            }
            ServiceState::Stopped => Err(ServiceError::NotRunning { name }),
        }
    }

    pub fn is_running(&self) -> bool {
        *self == ServiceState::Running
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{name} is already running")]
    AlreadyRunning { name: &'static str },
    #[error("{name} is not running")]
    NotRunning { name: &'static str },
    #[error("{name} failed to start: {reason}")]
    StartFailed { name: &'static str, reason: String },
}

impl HasSeverity for ServiceError {
    fn severity(&self) -> Severity {
        match self {
            ServiceError::AlreadyRunning { .. } => Severity::Sanity,
            ServiceError::NotRunning { .. } => Severity::Recoverable,
            ServiceError::StartFailed { .. } => Severity::Crisis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_is_stopped_running_stopped() {
        let mut state = ServiceState::default();
        assert!(!state.is_running());
        state.start("test").unwrap();
        assert!(state.is_running());
        let err = state.start("test").unwrap_err();
        assert_eq!(err.severity(), Severity::Sanity);
        state.stop("test").unwrap();
        assert!(state.stop("test").is_err());
        state.start("test").unwrap();
    }
}
