//! The daemon event loop.
//!
//! Each tick reaps exited workers, pumps every pool, hands control to the
//! application and spends whatever is left of the interval on idle-time
//! housekeeping. Signals are observed between ticks.

use crate::config::SupervisorSettings;
use mediator_worker::{signals, Mediator, MediatorError};
use nix::sys::signal::Signal;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const SUPERVISOR_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
];

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Pool '{alias}' failed: {source}")]
    Pool {
        alias: String,
        #[source]
        source: MediatorError,
    },

    #[error("Could not install signal handlers: {0}")]
    Signal(nix::errno::Errno),
}

/// What the application wants after a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    Shutdown,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Shutdown,
    /// SIGHUP; the caller should rebuild the daemon in recovery mode
    Restart,
}

/// The embedding application driven by the supervisor
pub trait Application {
    /// Called once after every pool has started
    fn setup(&mut self, _pools: &mut [Mediator]) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once per tick after the pools were pumped
    fn execute(&mut self, pools: &mut [Mediator]) -> anyhow::Result<Tick>;
}

pub struct Supervisor {
    settings: SupervisorSettings,
    pools: Vec<Mediator>,
    ticks: u64,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Supervisor {
            settings,
            pools: Vec::new(),
            ticks: 0,
        }
    }

    pub fn add_pool(&mut self, pool: Mediator) {
        info!("Registered pool '{}'", pool.alias());
        self.pools.push(pool);
    }

    pub fn pool(&mut self, alias: &str) -> Option<&mut Mediator> {
        self.pools.iter_mut().find(|p| p.alias() == alias)
    }

    pub fn pools(&self) -> &[Mediator] {
        &self.pools
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run until a shutdown or restart is requested, then tear the pools down.
    ///
    /// A fatal pool error also tears everything down before it is returned.
    pub fn run(&mut self, app: &mut dyn Application) -> anyhow::Result<Exit> {
        signals::install(&SUPERVISOR_SIGNALS).map_err(SupervisorError::Signal)?;

        let result = self.start(app).and_then(|_| self.event_loop(app));
        if let Err(e) = &result {
            error!("Supervisor stopping after fatal error: {:#}", e);
        }
        self.shutdown();

        if let Err(e) = signals::restore(&SUPERVISOR_SIGNALS) {
            warn!("Could not restore signal dispositions: {}", e);
        }
        result
    }

    fn start(&mut self, app: &mut dyn Application) -> anyhow::Result<()> {
        for pool in &mut self.pools {
            pool.start().map_err(|source| SupervisorError::Pool {
                alias: pool.alias().to_string(),
                source,
            })?;
        }
        app.setup(&mut self.pools)?;
        info!(
            "Supervisor running {} pools with a {}ms interval",
            self.pools.len(),
            self.settings.loop_interval_ms
        );
        Ok(())
    }

    fn event_loop(&mut self, app: &mut dyn Application) -> anyhow::Result<Exit> {
        let interval = Duration::from_millis(self.settings.loop_interval_ms);

        loop {
            let tick_started = Instant::now();

            if signals::take(Signal::SIGUSR1) {
                self.dump();
            }
            if signals::take(Signal::SIGHUP) {
                info!("Received SIGHUP, restarting");
                return Ok(Exit::Restart);
            }
            if signals::take(Signal::SIGTERM) || signals::take(Signal::SIGINT) {
                info!("Received shutdown signal");
                return Ok(Exit::Shutdown);
            }

            self.ticks += 1;
            if self.tick(app)? == Tick::Shutdown {
                info!("Application requested shutdown");
                return Ok(Exit::Shutdown);
            }

            for pool in &mut self.pools {
                let alias = pool.alias().to_string();
                check(&alias, pool.on_idle())?;
            }

            if let Some(remaining) = interval.checked_sub(tick_started.elapsed()) {
                std::thread::sleep(remaining);
            } else if !interval.is_zero() {
                debug!("Tick {} overran the {:?} interval", self.ticks, interval);
            }
        }
    }

    fn tick(&mut self, app: &mut dyn Application) -> anyhow::Result<Tick> {
        for pool in &mut self.pools {
            let alias = pool.alias().to_string();
            check(&alias, pool.reap_exited().map(|_| ()))?;
            check(&alias, pool.pump())?;
        }
        app.execute(&mut self.pools)
    }

    /// Step every pool's teardown until all workers are gone
    pub fn shutdown(&mut self) {
        info!("Shutting down {} pools", self.pools.len());
        let poll = Duration::from_millis(self.settings.shutdown_poll_ms);

        let mut pending: Vec<usize> = (0..self.pools.len()).collect();
        while !pending.is_empty() {
            pending.retain(|&i| {
                let pool = &mut self.pools[i];
                match pool.teardown() {
                    Ok(done) => !done,
                    Err(e) => {
                        error!("Pool '{}' teardown failed: {}", pool.alias(), e);
                        false
                    }
                }
            });
            if !pending.is_empty() {
                std::thread::sleep(poll);
            }
        }
        info!("Shutdown complete");
    }

    pub fn dump(&self) {
        info!("Supervisor statistics after {} ticks", self.ticks);
        for pool in &self.pools {
            pool.dump();
        }
    }
}

/// Fatal pool errors stop the supervisor; anything else is logged
fn check(alias: &str, result: mediator_worker::Result<()>) -> Result<(), SupervisorError> {
    match result {
        Ok(()) => Ok(()),
        Err(source) if source.is_fatal() => Err(SupervisorError::Pool {
            alias: alias.to_string(),
            source,
        }),
        Err(e) => {
            error!("Pool '{}': {}", alias, e);
            Ok(())
        }
    }
}
