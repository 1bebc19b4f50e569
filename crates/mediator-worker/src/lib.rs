pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod hook;
pub mod ipc_error;
pub mod mediator;
pub mod process;
pub mod signals;
pub mod stats;
pub mod worker;

pub use config::{BackoffConfig, ForkingStrategy, PoolConfig, RecyclePolicy};
pub use error::{MediatorError, Result};
pub use executor::CallExecutor;
pub use handler::{CallHandler, HandlerRegistry};
pub use hook::{NoopHook, ProtocolHook, ProtocolStep, TracingHook};
pub use ipc_error::{ErrorClass, ErrorCounts, Role, Thresholds};
pub use mediator::{Mediator, TimeoutAction};
pub use process::{ForkLauncher, Launcher, Spawned, TerminationReason};
pub use stats::{DurationSummary, MethodStats, PoolStats};
pub use worker::WorkerRuntime;
