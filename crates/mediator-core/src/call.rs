use crate::{CallError, Result, MAX_RECORD_SIZE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of a call, unique within one supervisor execution
pub type CallId = u64;

/// Result payload of a call. `Err` carries the error indicator of a failed callable.
pub type CallReturn = std::result::Result<Value, String>;

/// Call status in the mediation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CallStatus {
    /// Created by the parent, not yet handed to IPC
    Uncalled,
    /// Written to the Work Store and dispatched to the pool
    Called,
    /// Acked as running by a worker process
    Running,
    /// Worker finished and wrote the return value back
    Returned,
    /// Cancelled by the application or superseded by a re-dispatch
    Cancelled,
    /// Killed by the parent after exceeding the pool timeout
    TimedOut,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Uncalled => "uncalled",
            CallStatus::Called => "called",
            CallStatus::Running => "running",
            CallStatus::Returned => "returned",
            CallStatus::Cancelled => "cancelled",
            CallStatus::TimedOut => "timed_out",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uncalled" => Some(CallStatus::Uncalled),
            "called" => Some(CallStatus::Called),
            "running" => Some(CallStatus::Running),
            "returned" => Some(CallStatus::Returned),
            "cancelled" => Some(CallStatus::Cancelled),
            "timed_out" => Some(CallStatus::TimedOut),
            _ => None,
        }
    }

    /// Terminal calls are eligible for garbage collection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Returned | CallStatus::Cancelled | CallStatus::TimedOut
        )
    }

    /// Statuses during which the call arguments must be retained
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            CallStatus::Uncalled | CallStatus::Called | CallStatus::Running
        )
    }

    /// Whether a single attempt may move from `self` to `next`.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        use CallStatus::*;
        matches!(
            (self, next),
            (Uncalled, Called)
                | (Uncalled, Cancelled)
                | (Called, Running)
                | (Called, Cancelled)
                | (Running, Returned)
                | (Running, Cancelled)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock moment each status was entered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTimes {
    pub uncalled: Option<DateTime<Utc>>,
    pub called: Option<DateTime<Utc>>,
    pub running: Option<DateTime<Utc>>,
    pub returned: Option<DateTime<Utc>>,
    pub cancelled: Option<DateTime<Utc>>,
    pub timed_out: Option<DateTime<Utc>>,
}

impl CallTimes {
    pub fn get(&self, status: CallStatus) -> Option<DateTime<Utc>> {
        match status {
            CallStatus::Uncalled => self.uncalled,
            CallStatus::Called => self.called,
            CallStatus::Running => self.running,
            CallStatus::Returned => self.returned,
            CallStatus::Cancelled => self.cancelled,
            CallStatus::TimedOut => self.timed_out,
        }
    }

    pub fn set(&mut self, status: CallStatus, at: DateTime<Utc>) {
        let slot = match status {
            CallStatus::Uncalled => &mut self.uncalled,
            CallStatus::Called => &mut self.called,
            CallStatus::Running => &mut self.running,
            CallStatus::Returned => &mut self.returned,
            CallStatus::Cancelled => &mut self.cancelled,
            CallStatus::TimedOut => &mut self.timed_out,
        };
        *slot = Some(at);
    }
}

/// A single unit of mediated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Unique call identifier, doubles as the Work Store address
    pub id: CallId,

    /// Registered method to invoke in the worker
    pub method: String,

    /// Arguments, retained only while the call is active
    pub args: Option<Vec<Value>>,

    /// Current status
    pub status: CallStatus,

    /// Status entry timestamps
    pub time: CallTimes,

    /// Worker process handling (or last handling) this call
    pub pid: Option<i32>,

    /// Number of resubmissions
    pub retries: u32,

    /// Transient IPC failures during the current attempt
    pub errors: u32,

    /// Return payload once the call is Returned
    #[serde(rename = "return")]
    pub ret: Option<CallReturn>,

    /// Serialized size of the returned record
    pub size: Option<usize>,

    /// Heavy fields have been purged by the garbage collector
    pub gc: bool,
}

impl Call {
    /// Create a new Uncalled call
    pub fn new(id: CallId, method: impl Into<String>, args: Vec<Value>) -> Self {
        let mut time = CallTimes::default();
        time.set(CallStatus::Uncalled, Utc::now());

        Call {
            id,
            method: method.into(),
            args: Some(args),
            status: CallStatus::Uncalled,
            time,
            pid: None,
            retries: 0,
            errors: 0,
            ret: None,
            size: None,
            gc: false,
        }
    }

    /// Serialize the record for a Work Store slot
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_RECORD_SIZE {
            return Err(CallError::PayloadTooLarge {
                max: MAX_RECORD_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    /// Deserialize a record read from a Work Store slot
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(CallError::from)
    }

    /// Move forward along the state machine, stamping the entry time
    pub fn advance(&mut self, next: CallStatus) -> Result<()> {
        self.advance_at(next, Utc::now())
    }

    pub fn advance_at(&mut self, next: CallStatus, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(CallError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.time.set(next, at);
        Ok(())
    }

    /// Start a new attempt of this call.
    ///
    /// Used both for application-driven retries and for dropped-call
    /// recovery. The record goes back to Uncalled with `retries` incremented.
    pub fn resubmit(&mut self) -> Result<()> {
        if matches!(self.status, CallStatus::Uncalled | CallStatus::Running) {
            return Err(CallError::NotResubmittable {
                id: self.id,
                status: self.status,
            });
        }
        if self.gc || self.args.is_none() {
            return Err(CallError::Purged(self.id));
        }

        self.retries += 1;
        self.errors = 0;
        self.pid = None;
        self.ret = None;
        self.size = None;
        self.status = CallStatus::Uncalled;
        self.time = CallTimes::default();
        self.time.set(CallStatus::Uncalled, Utc::now());
        Ok(())
    }

    /// Drop arguments and return value of a terminal call.
    ///
    /// Returns false when there was nothing to do.
    pub fn purge(&mut self) -> bool {
        if self.gc || !self.status.is_terminal() {
            return false;
        }
        self.args = None;
        self.ret = None;
        self.gc = true;
        true
    }

    /// A dispatch envelope stamped before the record's own Called time
    /// belongs to an earlier attempt.
    pub fn is_stale_dispatch(&self, dispatched_at: DateTime<Utc>) -> bool {
        match self.time.called {
            Some(called) => dispatched_at < called,
            None => false,
        }
    }

    /// How long the call stayed in `status` before moving on
    pub fn duration_in(&self, status: CallStatus) -> Option<Duration> {
        let entered = self.time.get(status)?;
        let left = match status {
            CallStatus::Uncalled => self.time.called,
            CallStatus::Called => self.time.running,
            CallStatus::Running => self.time.returned,
            _ => None,
        }?;
        Some((left - entered).max(Duration::zero()))
    }

    /// Time spent Running so far, if the call is Running
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status != CallStatus::Running {
            return None;
        }
        self.time.running.map(|started| now - started)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.ret, Some(Err(_)))
    }
}
