use mediator_core::Call;
use std::fmt;
use tracing::debug;

/// Parent-side protocol steps a hook can observe or veto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStep {
    Fork,
    Encode,
    Decode,
    Destroy,
}

impl fmt::Display for ProtocolStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolStep::Fork => "fork",
            ProtocolStep::Encode => "encode",
            ProtocolStep::Decode => "decode",
            ProtocolStep::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

/// Interception point consulted before each protocol step.
///
/// Returning false skips the step. A vetoed fork or dispatch does not
/// happen, and a vetoed destroy preserves the IPC resources. A vetoed ack
/// is held by the pool and offered to the hook again on the next pump.
pub trait ProtocolHook {
    fn before(&mut self, step: ProtocolStep, call: Option<&Call>) -> bool;
}

/// Lets every step through
pub struct NoopHook;

impl ProtocolHook for NoopHook {
    fn before(&mut self, _step: ProtocolStep, _call: Option<&Call>) -> bool {
        true
    }
}

/// Logs every step at debug level
pub struct TracingHook {
    alias: String,
}

impl TracingHook {
    pub fn new(alias: impl Into<String>) -> Self {
        TracingHook {
            alias: alias.into(),
        }
    }
}

impl ProtocolHook for TracingHook {
    fn before(&mut self, step: ProtocolStep, call: Option<&Call>) -> bool {
        match call {
            Some(call) => debug!(
                alias = %self.alias,
                call_id = call.id,
                method = %call.method,
                status = %call.status,
                "protocol step: {}",
                step
            ),
            None => debug!(alias = %self.alias, "protocol step: {}", step),
        }
        true
    }
}
