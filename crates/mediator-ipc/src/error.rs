use mediator_core::CallError;
use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    #[error("Work Store exhausted: no free extent for {needed} bytes")]
    Exhausted { needed: usize },

    #[error("Work Store directory is full ({slots} slots)")]
    DirectoryFull { slots: usize },

    #[error("Corrupt Work Store slot at address {address}: {reason}")]
    Corrupt { address: u64, reason: String },

    #[error("Work Store segment is not initialized or has an unknown layout")]
    BadSegment,

    #[error("Work Store schema version mismatch: segment has {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Timed out waiting for the Work Store lock held by pid {owner}")]
    LockTimeout { owner: u32 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Call record error: {0}")]
    Record(#[from] CallError),

    #[error("Invalid IPC resource name: {0:?}")]
    InvalidName(String),
}

impl IpcError {
    pub(crate) fn os(op: &'static str) -> impl FnOnce(Errno) -> IpcError {
        move |errno| IpcError::Os { op, errno }
    }

    pub(crate) fn io(op: &'static str, err: std::io::Error) -> IpcError {
        IpcError::Os {
            op,
            errno: Errno::from_raw(err.raw_os_error().unwrap_or(Errno::EIO as i32)),
        }
    }

    /// OS error number behind this failure, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            IpcError::Os { errno, .. } => Some(*errno),
            IpcError::LockTimeout { .. } => Some(Errno::EAGAIN),
            _ => None,
        }
    }

    /// Failures that mean the shared segment (or its contents) can't be trusted
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            IpcError::Exhausted { .. }
                | IpcError::DirectoryFull { .. }
                | IpcError::Corrupt { .. }
                | IpcError::BadSegment
                | IpcError::Record(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
