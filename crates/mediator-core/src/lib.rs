mod call;
mod error;
mod method;

pub use call::{Call, CallId, CallReturn, CallStatus, CallTimes};
pub use error::{CallError, Result};
pub use method::validate_method_name;

/// Largest serialized call record accepted for a single Work Store slot (4MB).
pub const MAX_RECORD_SIZE: usize = 4 * 1024 * 1024;

/// Work Store address reserved for the segment header.
pub const HEADER_ADDRESS: CallId = 1;

/// First id handed out to a call. Ids below this are reserved.
pub const FIRST_CALL_ID: CallId = HEADER_ADDRESS + 1;
