use crate::{Envelope, EnvelopeCodec, IpcError, MessageType, Result, MAX_ENVELOPE_SIZE};
use nix::errno::Errno;
use nix::mqueue::{
    mq_close, mq_getattr, mq_open, mq_receive, mq_remove_nonblock, mq_send, mq_set_nonblock,
    mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::Mode;
use std::ffi::CString;
use tracing::{debug, warn};

/// Linux's `msg_default` when procfs can't be read
const FALLBACK_QUEUE_DEPTH: usize = 10;

/// Pending messages per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub call: usize,
    pub running: usize,
    pub ret: usize,
}

impl ChannelStats {
    pub fn total(&self) -> usize {
        self.call + self.running + self.ret
    }
}

struct Queue {
    message_type: MessageType,
    mqd: MqdT,
    msgsize: usize,
}

/// Typed FIFO notifications over three POSIX message queues.
///
/// Descriptors are opened non-blocking. A blocking receive clears the flag
/// for the duration of the call; the flag lives on this process's open
/// description only.
pub struct NotificationChannel {
    base: String,
    depth: usize,
    queues: Vec<Queue>,
}

impl NotificationChannel {
    pub fn open(base: &str, depth: usize) -> Result<Self> {
        let queues = open_queues(base, depth)?;
        Ok(NotificationChannel {
            base: base.to_string(),
            depth,
            queues,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn queue(&self, message_type: MessageType) -> Result<&Queue> {
        self.queues
            .iter()
            .find(|q| q.message_type == message_type)
            .ok_or(IpcError::Os {
                op: "mq_lookup",
                errno: Errno::EBADF,
            })
    }

    pub fn send(&self, message_type: MessageType, envelope: &Envelope) -> Result<()> {
        let frame = EnvelopeCodec::encode(message_type, envelope)?;
        let queue = self.queue(message_type)?;
        mq_send(&queue.mqd, &frame, 0).map_err(IpcError::os("mq_send"))
    }

    /// Take the next envelope of `message_type`.
    ///
    /// Non-blocking receives return `Ok(None)` when the queue is empty. A
    /// blocking receive interrupted by a signal fails with `EINTR`.
    pub fn receive(&self, message_type: MessageType, blocking: bool) -> Result<Option<Envelope>> {
        let queue = self.queue(message_type)?;
        let mut buf = vec![0u8; queue.msgsize];
        let mut priority = 0u32;

        if blocking {
            mq_remove_nonblock(&queue.mqd).map_err(IpcError::os("mq_setattr"))?;
        }
        let received = mq_receive(&queue.mqd, &mut buf, &mut priority);
        if blocking {
            mq_set_nonblock(&queue.mqd).map_err(IpcError::os("mq_setattr"))?;
        }

        let len = match received {
            Ok(len) => len,
            Err(Errno::EAGAIN) if !blocking => return Ok(None),
            Err(errno) => {
                return Err(IpcError::Os {
                    op: "mq_receive",
                    errno,
                })
            }
        };

        let (frame_type, envelope) = EnvelopeCodec::decode(&buf[..len])?;
        if frame_type != message_type {
            return Err(IpcError::InvalidMessageType(frame_type.as_u8()));
        }
        Ok(Some(envelope))
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        let mut stats = ChannelStats::default();
        for queue in &self.queues {
            let pending = mq_getattr(&queue.mqd)
                .map_err(IpcError::os("mq_getattr"))?
                .curmsgs() as usize;
            match queue.message_type {
                MessageType::Call => stats.call = pending,
                MessageType::Running => stats.running = pending,
                MessageType::Return => stats.ret = pending,
            }
        }
        Ok(stats)
    }

    /// Close and reopen every queue descriptor
    pub fn reopen(&mut self) -> Result<()> {
        self.close();
        self.queues = open_queues(&self.base, self.depth)?;
        debug!(channel = %self.base, "Reopened notification queues");
        Ok(())
    }

    /// Close descriptors and unlink the queues; buffered messages are lost
    pub fn destroy(&mut self) -> Result<()> {
        self.close();
        Self::unlink(&self.base)
    }

    /// Unlink the queues under `base` if they exist
    pub fn unlink(base: &str) -> Result<()> {
        for message_type in MessageType::ALL {
            let name = queue_name(base, message_type)?;
            match mq_unlink(name.as_c_str()) {
                Ok(()) | Err(Errno::ENOENT) => {}
                Err(errno) => {
                    return Err(IpcError::Os {
                        op: "mq_unlink",
                        errno,
                    })
                }
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        for queue in self.queues.drain(..) {
            if let Err(e) = mq_close(queue.mqd) {
                warn!(channel = %self.base, error = %e, "mq_close failed");
            }
        }
    }
}

impl Drop for NotificationChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn queue_name(base: &str, message_type: MessageType) -> Result<CString> {
    let name = format!("{}.{}", base, message_type.suffix());
    let valid = name.starts_with('/') && name.len() <= 255 && !name[1..].contains('/');
    if !valid {
        return Err(IpcError::InvalidName(name));
    }
    CString::new(name.clone()).map_err(|_| IpcError::InvalidName(name))
}

fn open_queues(base: &str, depth: usize) -> Result<Vec<Queue>> {
    MessageType::ALL
        .iter()
        .map(|message_type| open_queue(base, *message_type, depth))
        .collect()
}

fn open_queue(base: &str, message_type: MessageType, depth: usize) -> Result<Queue> {
    let name = queue_name(base, message_type)?;
    let flags = MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK;
    let mode = Mode::from_bits_truncate(0o600);
    let attr = MqAttr::new(0, depth as _, MAX_ENVELOPE_SIZE as _, 0);

    let mqd = match mq_open(name.as_c_str(), flags, mode, Some(&attr)) {
        Ok(mqd) => mqd,
        Err(Errno::EINVAL) => {
            let fallback = system_default_depth();
            debug!(queue = ?name, depth, fallback, "Queue depth rejected, using system default");
            let attr = MqAttr::new(0, fallback as _, MAX_ENVELOPE_SIZE as _, 0);
            mq_open(name.as_c_str(), flags, mode, Some(&attr)).map_err(IpcError::os("mq_open"))?
        }
        Err(errno) => return Err(IpcError::Os { op: "mq_open", errno }),
    };

    let msgsize = mq_getattr(&mqd).map_err(IpcError::os("mq_getattr"))?.msgsize() as usize;

    Ok(Queue {
        message_type,
        mqd,
        msgsize: msgsize.max(MAX_ENVELOPE_SIZE),
    })
}

/// Depth the kernel would pick for an attr-less open, never above `msg_max`
fn system_default_depth() -> usize {
    let read = |knob: &str| {
        std::fs::read_to_string(format!("/proc/sys/fs/mqueue/{}", knob))
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
    };
    let default = read("msg_default").unwrap_or(FALLBACK_QUEUE_DEPTH);
    match read("msg_max") {
        Some(max) => default.min(max).max(1),
        None => default.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mediator_core::CallStatus;

    struct Channel(NotificationChannel);

    impl Drop for Channel {
        fn drop(&mut self) {
            let _ = self.0.destroy();
        }
    }

    fn channel(depth: usize) -> Channel {
        let base = format!("/mediator-test-{}", uuid::Uuid::new_v4().simple());
        Channel(NotificationChannel::open(&base, depth).unwrap())
    }

    fn envelope(call_id: u64, status: CallStatus) -> Envelope {
        Envelope {
            call_id,
            status,
            microtime: Utc::now(),
            pid: std::process::id() as i32,
        }
    }

    #[test]
    fn test_send_receive() {
        let c = channel(10);
        let sent = envelope(2, CallStatus::Called);

        c.0.send(MessageType::Call, &sent).unwrap();
        assert_eq!(c.0.stats().unwrap().call, 1);

        let received = c.0.receive(MessageType::Call, false).unwrap();
        assert_eq!(received, Some(sent));
        assert_eq!(c.0.stats().unwrap().total(), 0);
    }

    #[test]
    fn test_empty_nonblocking_receive() {
        let c = channel(10);
        assert_eq!(c.0.receive(MessageType::Return, false).unwrap(), None);
    }

    #[test]
    fn test_queues_are_typed_and_fifo() {
        let c = channel(10);
        c.0.send(MessageType::Running, &envelope(3, CallStatus::Running)).unwrap();
        c.0.send(MessageType::Running, &envelope(4, CallStatus::Running)).unwrap();
        c.0.send(MessageType::Return, &envelope(5, CallStatus::Returned)).unwrap();

        let stats = c.0.stats().unwrap();
        assert_eq!((stats.call, stats.running, stats.ret), (0, 2, 1));

        let first = c.0.receive(MessageType::Running, false).unwrap().unwrap();
        let second = c.0.receive(MessageType::Running, false).unwrap().unwrap();
        assert_eq!((first.call_id, second.call_id), (3, 4));
        assert_eq!(c.0.receive(MessageType::Call, false).unwrap(), None);
    }

    #[test]
    fn test_blocking_receive_with_pending_message() {
        let c = channel(10);
        c.0.send(MessageType::Call, &envelope(6, CallStatus::Called)).unwrap();

        let received = c.0.receive(MessageType::Call, true).unwrap().unwrap();
        assert_eq!(received.call_id, 6);

        // Descriptor is back in non-blocking mode
        assert_eq!(c.0.receive(MessageType::Call, false).unwrap(), None);
    }

    #[test]
    fn test_full_queue_reports_eagain() {
        let c = channel(10);
        let depth = mq_getattr(&c.0.queue(MessageType::Call).unwrap().mqd)
            .unwrap()
            .maxmsg() as usize;

        for id in 0..depth {
            c.0.send(MessageType::Call, &envelope(id as u64 + 2, CallStatus::Called))
                .unwrap();
        }
        let err = c.0
            .send(MessageType::Call, &envelope(999, CallStatus::Called))
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EAGAIN));
    }

    #[test]
    fn test_reopen_keeps_messages() {
        let mut c = channel(10);
        c.0.send(MessageType::Return, &envelope(7, CallStatus::Returned)).unwrap();
        c.0.reopen().unwrap();

        assert_eq!(c.0.stats().unwrap().ret, 1);
    }

    #[test]
    fn test_destroy_discards_messages() {
        let mut c = channel(10);
        c.0.send(MessageType::Call, &envelope(8, CallStatus::Called)).unwrap();
        c.0.destroy().unwrap();

        assert!(c.0.stats().unwrap().total() == 0);
        assert!(c.0.send(MessageType::Call, &envelope(9, CallStatus::Called)).is_err());

        c.0.reopen().unwrap();
        assert_eq!(c.0.stats().unwrap().total(), 0);
    }

    #[test]
    fn test_oversized_depth_falls_back() {
        let c = channel(1_000_000);
        c.0.send(MessageType::Call, &envelope(10, CallStatus::Called)).unwrap();
        assert_eq!(c.0.stats().unwrap().call, 1);

        let attr = mq_getattr(&c.0.queue(MessageType::Call).unwrap().mqd).unwrap();
        assert_eq!(attr.maxmsg() as usize, system_default_depth());
        assert_eq!(attr.msgsize() as usize, MAX_ENVELOPE_SIZE);
    }
}
