use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How eagerly the pool forks, derived from the supervisor tick interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkingStrategy {
    /// Fork one process at a time, only when every process is busy
    Lazy,
    /// Fork the whole pool on the first call
    Mixed,
    /// Fork the whole pool at startup and keep it full
    Aggressive,
}

impl ForkingStrategy {
    /// Zero or long intervals fork lazily, moderate ones defer, tight loops pre-fork.
    pub fn from_loop_interval(interval: Duration) -> Self {
        let ms = interval.as_millis();
        if ms == 0 || ms > 2000 {
            ForkingStrategy::Lazy
        } else if ms > 1000 {
            ForkingStrategy::Mixed
        } else {
            ForkingStrategy::Aggressive
        }
    }
}

/// Worker self-recycling thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecyclePolicy {
    /// Calls processed before a worker may recycle (plus jitter)
    pub max_calls: u32,
    /// Minimum runtime before `max_calls` applies
    pub min_runtime_secs: u64,
    /// Unconditional recycle after this runtime (plus jitter x 10s)
    pub max_runtime_secs: u64,
    /// Spread thresholds randomly across the pool
    pub jitter: bool,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        RecyclePolicy {
            max_calls: 25,
            min_runtime_secs: 5 * 60,
            max_runtime_secs: 30 * 60,
            jitter: true,
        }
    }
}

/// Base delays for the exponential IPC error backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub parent_base_ms: u64,
    pub worker_communication_base_ms: u64,
    pub worker_base_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            parent_base_ms: 20,
            worker_communication_base_ms: 2000,
            worker_base_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pool name, unique within the daemon
    pub alias: String,
    /// Daemon identity; together with `alias` it names the IPC resources
    pub daemon_id: String,
    /// Number of worker processes
    pub workers: usize,
    /// Per-call timeout measured from Running; 0 disables enforcement
    pub timeout_ms: u64,
    /// Work Store size in bytes
    pub memory_allocation: usize,
    /// Supervisor tick interval, used to pick the forking strategy
    pub loop_interval_ms: u64,
    /// Explicit strategy; derived from `loop_interval_ms` when unset
    pub forking_strategy: Option<ForkingStrategy>,
    /// Reattach to existing IPC resources instead of wiping them
    pub recover: bool,
    /// Requested message queue depth
    pub queue_depth: usize,
    /// Warn once when a returned record exceeds this fraction of the allocation
    pub memory_warning_fraction: f64,
    /// Time a fresh process gets to ack its first call before dropped-call detection runs
    pub first_ack_grace_secs: u64,
    /// Worker loop sleep between receives
    pub poll_interval_ms: u64,
    pub recycle: RecyclePolicy,
    pub backoff: BackoffConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            alias: "default".to_string(),
            daemon_id: "mediatord".to_string(),
            workers: 1,
            timeout_ms: 0,
            memory_allocation: 5 * 1024 * 1024,
            loop_interval_ms: 1000,
            forking_strategy: None,
            recover: false,
            queue_depth: 10,
            memory_warning_fraction: 1.0 / 50.0,
            first_ack_grace_secs: 30,
            poll_interval_ms: 50,
            recycle: RecyclePolicy::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(alias: impl Into<String>) -> Self {
        PoolConfig {
            alias: alias.into(),
            ..Default::default()
        }
    }

    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PoolConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn strategy(&self) -> ForkingStrategy {
        self.forking_strategy.unwrap_or_else(|| {
            ForkingStrategy::from_loop_interval(Duration::from_millis(self.loop_interval_ms))
        })
    }

    pub fn first_ack_grace(&self) -> Duration {
        Duration::from_secs(self.first_ack_grace_secs)
    }

    /// Seconds between idle-time garbage collection runs
    pub fn gc_interval(&self) -> Duration {
        let workers = self.workers.max(1) as f64;
        Duration::from_secs((30.0 / (workers * 0.5)).ceil() as u64)
    }

    /// IPC resource name shared by the Work Store and the queues
    pub fn resource_name(&self) -> String {
        mediator_ipc::resource_name(&self.daemon_id, &self.alias)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.alias.is_empty() {
            return Err("alias must not be empty".to_string());
        }
        if self.workers == 0 {
            return Err(format!("pool '{}' needs at least one worker", self.alias));
        }
        if self.queue_depth == 0 {
            return Err(format!("pool '{}' needs a queue depth above zero", self.alias));
        }
        if !(self.memory_warning_fraction > 0.0 && self.memory_warning_fraction <= 1.0) {
            return Err(format!(
                "pool '{}' memory_warning_fraction must be in (0, 1]",
                self.alias
            ));
        }
        Ok(())
    }
}
