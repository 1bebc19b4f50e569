use mediator_worker::PoolConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: SupervisorSettings,
    pub pools: Vec<PoolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Identity shared by every pool's IPC resource names
    pub daemon_id: String,
    /// Tick length; also picks each pool's forking strategy
    pub loop_interval_ms: u64,
    /// Reattach to IPC resources left by a previous run
    pub recover_workers: bool,
    /// Pause between teardown steps during shutdown
    pub shutdown_poll_ms: u64,
    pub log_level: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            daemon_id: "mediatord".to_string(),
            loop_interval_ms: 1000,
            recover_workers: false,
            shutdown_poll_ms: 100,
            log_level: "info".to_string(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            daemon: SupervisorSettings::default(),
            pools: vec![PoolConfig::new("default")],
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Pool configs with the daemon-wide settings applied
    pub fn resolved_pools(&self) -> Vec<PoolConfig> {
        self.pools
            .iter()
            .cloned()
            .map(|mut pool| {
                pool.daemon_id = self.daemon.daemon_id.clone();
                pool.loop_interval_ms = self.daemon.loop_interval_ms;
                pool.recover |= self.daemon.recover_workers;
                pool
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.pools.is_empty() {
            return Err("at least one pool must be configured".to_string());
        }
        let mut aliases: Vec<&str> = self.pools.iter().map(|p| p.alias.as_str()).collect();
        aliases.sort_unstable();
        if let Some(pair) = aliases.windows(2).find(|w| w[0] == w[1]) {
            return Err(format!("duplicate pool alias '{}'", pair[0]));
        }
        self.pools.iter().try_for_each(PoolConfig::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_worker::ForkingStrategy;
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
daemon:
  daemon_id: thumbnailer
  loop_interval_ms: 500
pools:
  - alias: resize
    workers: 4
    timeout_ms: 10000
  - alias: upload
    workers: 2
    recover: true
"#
        )
        .unwrap();

        let config = DaemonConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.daemon.shutdown_poll_ms, 100);

        let pools = config.resolved_pools();
        assert_eq!(pools.len(), 2);
        assert!(pools.iter().all(|p| p.daemon_id == "thumbnailer"));
        assert_eq!(pools[0].strategy(), ForkingStrategy::Aggressive);
        assert_eq!(pools[0].workers, 4);
        assert!(!pools[0].recover);
        assert!(pools[1].recover);
    }

    #[test]
    fn test_recover_workers_applies_to_every_pool() {
        let mut config = DaemonConfig::default();
        config.daemon.recover_workers = true;
        assert!(config.resolved_pools().iter().all(|p| p.recover));
    }

    #[test]
    fn test_validate() {
        assert!(DaemonConfig::default().validate().is_ok());

        let mut config = DaemonConfig::default();
        config.pools.push(PoolConfig::new("default"));
        assert!(config.validate().unwrap_err().contains("duplicate"));

        config.pools.clear();
        assert!(config.validate().is_err());
    }
}
