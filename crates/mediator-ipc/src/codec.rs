use crate::{Envelope, IpcError, MessageType, Result, ENVELOPE_VERSION, MAX_ENVELOPE_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Codec for Notification Channel envelopes
///
/// Frame format: [1-byte version] [1-byte message type] [bincode payload]
///
/// Message queues preserve message boundaries, so no length prefix is needed.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn encode(message_type: MessageType, envelope: &Envelope) -> Result<Bytes> {
        let payload = bincode::serialize(envelope)?;

        let total_length = 2 + payload.len();
        if total_length > MAX_ENVELOPE_SIZE {
            return Err(IpcError::MessageTooLarge(total_length));
        }

        let mut dst = BytesMut::with_capacity(total_length);
        dst.put_u8(ENVELOPE_VERSION);
        dst.put_u8(message_type.as_u8());
        dst.put_slice(&payload);

        Ok(dst.freeze())
    }

    pub fn decode(frame: &[u8]) -> Result<(MessageType, Envelope)> {
        if frame.len() > MAX_ENVELOPE_SIZE {
            return Err(IpcError::MessageTooLarge(frame.len()));
        }
        if frame.len() < 2 {
            return Err(IpcError::UnsupportedVersion(0));
        }

        let mut src = frame;
        let version = src.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(IpcError::UnsupportedVersion(version));
        }

        let type_byte = src.get_u8();
        let message_type =
            MessageType::from_u8(type_byte).ok_or(IpcError::InvalidMessageType(type_byte))?;

        let envelope = bincode::deserialize(src)?;
        Ok((message_type, envelope))
    }
}
