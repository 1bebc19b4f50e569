mod channel;
mod codec;
mod error;
mod message;
mod store;

pub use channel::{ChannelStats, NotificationChannel};
pub use codec::EnvelopeCodec;
pub use error::{IpcError, Result};
pub use message::{Envelope, MessageType};
pub use store::{StoreHeader, StoreUsage, WorkStore};

/// Version byte leading every envelope frame
pub const ENVELOPE_VERSION: u8 = 1;

/// Largest envelope frame; also the requested queue message size
pub const MAX_ENVELOPE_SIZE: usize = 256;

/// Call Record schema version recorded in the Work Store header slot
pub const STORE_SCHEMA_VERSION: u32 = 2;

/// Name shared by the Work Store segment and the queue base of one pool.
///
/// Characters outside `[A-Za-z0-9_-]` are replaced so the result is a valid
/// POSIX IPC name.
pub fn resource_name(daemon_id: &str, alias: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(96)
            .collect()
    };
    format!("/mediator-{}-{}", clean(daemon_id), clean(alias))
}
