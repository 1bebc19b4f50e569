//! Classification of Work Store and Notification Channel failures.
//!
//! Every IPC failure lands in one bucket. Each bucket has its own error
//! counter with a per-role threshold; crossing it is fatal for the process.

use mediator_ipc::IpcError;
use nix::errno::Errno;
use std::fmt;
use std::time::Duration;

/// Which side of the pool is handling the error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Interrupted or nothing to receive; retry immediately
    Ignore,
    /// Resource temporarily unavailable; back off and retry
    Transient,
    /// Handle invalidated; back off and reattach
    Communication,
    /// Segment corrupt or exhausted; diagnose
    Corruption,
    /// Anything else; back off, reattach, give up on the operation
    Catchall,
}

impl ErrorClass {
    pub fn classify(err: &IpcError) -> Self {
        if err.is_corruption() {
            return ErrorClass::Corruption;
        }
        match err.errno() {
            Some(Errno::EINTR) | Some(Errno::ENOMSG) => ErrorClass::Ignore,
            Some(Errno::EAGAIN) => ErrorClass::Transient,
            Some(Errno::EINVAL) | Some(Errno::EIDRM) | Some(Errno::EBADF) | Some(Errno::ENOENT) => {
                ErrorClass::Communication
            }
            _ => ErrorClass::Catchall,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Ignore => "ignore",
            ErrorClass::Transient => "transient",
            ErrorClass::Communication => "communication",
            ErrorClass::Corruption => "corruption",
            ErrorClass::Catchall => "catchall",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error counts tolerated before the process gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub communication: u32,
    pub corruption: u32,
    pub catchall: u32,
}

impl Thresholds {
    /// The parent supervises the pool and tolerates more than a worker.
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::Worker => Thresholds {
                communication: 10,
                corruption: 10,
                catchall: 10,
            },
            Role::Parent => Thresholds {
                communication: 50,
                corruption: 25,
                catchall: 25,
            },
        }
    }

    pub fn get(&self, class: ErrorClass) -> Option<u32> {
        match class {
            ErrorClass::Communication => Some(self.communication),
            ErrorClass::Corruption => Some(self.corruption),
            ErrorClass::Catchall => Some(self.catchall),
            ErrorClass::Ignore | ErrorClass::Transient => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounts {
    pub communication: u32,
    pub corruption: u32,
    pub catchall: u32,
}

impl ErrorCounts {
    /// Bump the counter for `class`, returning the new count
    pub fn increment(&mut self, class: ErrorClass) -> u32 {
        let counter = match class {
            ErrorClass::Communication => &mut self.communication,
            ErrorClass::Corruption => &mut self.corruption,
            ErrorClass::Catchall => &mut self.catchall,
            ErrorClass::Ignore | ErrorClass::Transient => return 0,
        };
        *counter += 1;
        *counter
    }

    pub fn get(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Communication => self.communication,
            ErrorClass::Corruption => self.corruption,
            ErrorClass::Catchall => self.catchall,
            ErrorClass::Ignore | ErrorClass::Transient => 0,
        }
    }

    /// Whether `class` has gone past its threshold
    pub fn exceeded(&self, class: ErrorClass, thresholds: &Thresholds) -> bool {
        thresholds
            .get(class)
            .is_some_and(|limit| self.get(class) > limit)
    }
}

/// `base * 2^min(max(attempt, 1), 8) - base`
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.clamp(1, 8);
    base * 2u32.pow(exponent) - base
}
