pub mod config;
pub mod supervisor;

pub use config::{DaemonConfig, SupervisorSettings};
pub use supervisor::{Application, Exit, Supervisor, SupervisorError, Tick};
