use chrono::{DateTime, Utc};
use mediator_core::{Call, CallId, CallStatus};
use serde::{Deserialize, Serialize};

/// Notification Channel message types, one per announced transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Worker finished a call (Running -> Returned)
    Return = 1,
    /// Worker picked up a call (Called -> Running)
    Running = 2,
    /// Parent dispatched a call (Uncalled -> Called)
    Call = 3,
}

impl MessageType {
    pub const ALL: [MessageType; 3] = [MessageType::Call, MessageType::Running, MessageType::Return];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MessageType::Return),
            2 => Some(MessageType::Running),
            3 => Some(MessageType::Call),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Message type announcing that a call has entered `status`
    pub fn for_status(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Called => Some(MessageType::Call),
            CallStatus::Running => Some(MessageType::Running),
            CallStatus::Returned => Some(MessageType::Return),
            _ => None,
        }
    }

    /// Queue name suffix
    pub fn suffix(&self) -> &'static str {
        match self {
            MessageType::Call => "call",
            MessageType::Running => "running",
            MessageType::Return => "return",
        }
    }
}

/// Small notification that a Work Store address is ready to be read.
///
/// Only `call_id` is authoritative. Receivers reread the record and use
/// `status` and `microtime` as coarse hints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub call_id: CallId,
    pub status: CallStatus,
    /// Moment the announced status was entered
    pub microtime: DateTime<Utc>,
    /// Sender pid
    pub pid: i32,
}

impl Envelope {
    /// Build the envelope announcing the current status of `call`.
    ///
    /// Returns None for statuses that are never announced.
    pub fn for_call(call: &Call, pid: i32) -> Option<(MessageType, Envelope)> {
        let message_type = MessageType::for_status(call.status)?;
        let microtime = call.time.get(call.status)?;
        Some((
            message_type,
            Envelope {
                call_id: call.id,
                status: call.status,
                microtime,
                pid,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(1), Some(MessageType::Return));
        assert_eq!(MessageType::from_u8(3), Some(MessageType::Call));
        assert_eq!(MessageType::from_u8(99), None);

        assert_eq!(MessageType::Running.as_u8(), 2);
        assert_eq!(MessageType::Call.as_u8(), 3);
    }

    #[test]
    fn test_envelope_for_call() {
        let mut call = Call::new(2, "square", vec![json!(7)]);
        assert!(Envelope::for_call(&call, 1).is_none());

        call.advance(CallStatus::Called).unwrap();
        let (message_type, envelope) = Envelope::for_call(&call, 100).unwrap();

        assert_eq!(message_type, MessageType::Call);
        assert_eq!(envelope.call_id, 2);
        assert_eq!(Some(envelope.microtime), call.time.called);
        assert_eq!(envelope.pid, 100);
    }
}
