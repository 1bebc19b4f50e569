use crate::hook::ProtocolStep;
use crate::ipc_error::ErrorClass;
use mediator_core::{CallError, CallId};
use mediator_ipc::IpcError;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediatorError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error("Could not fork: {0}")]
    Fork(Errno),

    #[error("IPC '{class}' error threshold reached ({count} errors)")]
    Threshold { class: ErrorClass, count: u32 },

    #[error("Recently forked processes are continuously failing ({0} early deaths)")]
    CrashLoop(u32),

    #[error("Shared memory failure: unable to proceed")]
    SharedMemory,

    #[error("Call {id} could not be dispatched: {reason}")]
    Dispatch { id: CallId, reason: String },

    #[error("{0} vetoed by protocol hook")]
    Vetoed(ProtocolStep),

    #[error("Environment check failed: {}", .0.join("; "))]
    Environment(Vec<String>),

    #[error("Invalid pool configuration: {0}")]
    Config(String),

    #[error("Signal handling error: {0}")]
    Signal(Errno),
}

impl MediatorError {
    /// Errors after which the process must not continue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MediatorError::Fork(_)
                | MediatorError::Threshold { .. }
                | MediatorError::CrashLoop(_)
                | MediatorError::SharedMemory
        )
    }
}

pub type Result<T> = std::result::Result<T, MediatorError>;
