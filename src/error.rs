/*
    Copyright © 2024, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Error severities and the [`Fault`] reports that components send to the node supervisor.
//!
//! Every error enum in angine can say how bad it is through [`HasSeverity`]:
//! - [`Severity::Recoverable`] errors are returned to the caller, and the component carries on.
//! - [`Severity::Crisis`] errors mean that the node can no longer make durable progress, e.g., because the
//!   write-ahead log cannot be written.
//! - [`Severity::Sanity`] errors mean that an invariant that should always hold has been broken.
//!
//! Crisis and sanity faults stop the node.

use std::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Recoverable,
    Crisis,
    Sanity,
}

impl Severity {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Severity::Recoverable)
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Recoverable => f.write_str("recoverable"),
            Severity::Crisis => f.write_str("crisis"),
            Severity::Sanity => f.write_str("sanity"),
        }
    }
}

pub trait HasSeverity {
    fn severity(&self) -> Severity;
}

/// An error that escaped a component's thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub component: &'static str,
    pub severity: Severity,
    pub message: String,
}

impl Fault {
    pub fn new<E: HasSeverity + Display>(component: &'static str, error: &E) -> Fault {
        Fault {
            component,
            severity: error.severity(),
            message: error.to_string(),
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault in {}: {}", self.severity, self.component, self.message)
    }
}
