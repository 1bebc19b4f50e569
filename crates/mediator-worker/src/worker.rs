use crate::config::PoolConfig;
use crate::error::{MediatorError, Result};
use crate::executor::CallExecutor;
use crate::handler::HandlerRegistry;
use crate::ipc_error::{backoff, ErrorClass, ErrorCounts, Role, Thresholds};
use crate::signals;
use mediator_core::{Call, CallError, CallId, CallStatus};
use mediator_ipc::{Envelope, IpcError, MessageType, NotificationChannel, WorkStore};
use nix::sys::signal::Signal;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const WORKER_SIGNALS: [Signal; 4] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
];

/// Attempts at writing a record and sending its ack
const MAX_ENCODE_ATTEMPTS: u32 = 3;

/// Sum of three uniform draws scaled to [-30, 30], so most workers land near zero
pub(crate) fn recycle_jitter<R: Rng>(rng: &mut R) -> i64 {
    let sum: i64 = (0..3).map(|_| rng.gen_range(-1000..=1000)).sum();
    (sum as f64 / 100.0).round() as i64
}

/// The reduced mediator running inside each forked worker process.
///
/// Blocks on the call queue, executes one call at a time and acks each
/// transition back to the parent. Never forks.
pub struct WorkerRuntime<'a> {
    config: &'a PoolConfig,
    registry: &'a HandlerRegistry,
    store: WorkStore,
    channel: NotificationChannel,
    calls: HashMap<CallId, Call>,
    errors: ErrorCounts,
    thresholds: Thresholds,
    pid: i32,
    started: Instant,
    processed: u32,
    max_calls: u32,
    max_runtime: Duration,
}

impl<'a> WorkerRuntime<'a> {
    /// Open this process's own IPC handles.
    ///
    /// Queue descriptors inherited from the parent share their blocking flag
    /// with it, so the worker always opens fresh ones.
    pub fn new(config: &'a PoolConfig, registry: &'a HandlerRegistry) -> Result<Self> {
        let name = config.resource_name();
        let store = WorkStore::open(&name, config.memory_allocation)?;
        let channel = NotificationChannel::open(&name, config.queue_depth)?;

        let jitter = if config.recycle.jitter {
            recycle_jitter(&mut rand::thread_rng())
        } else {
            0
        };
        let max_calls = (i64::from(config.recycle.max_calls) + jitter).max(1) as u32;
        let max_runtime =
            Duration::from_secs((config.recycle.max_runtime_secs as i64 + jitter * 10).max(1) as u64);

        Ok(WorkerRuntime {
            config,
            registry,
            store,
            channel,
            calls: HashMap::new(),
            errors: ErrorCounts::default(),
            thresholds: Thresholds::for_role(Role::Worker),
            pid: std::process::id() as i32,
            started: Instant::now(),
            processed: 0,
            max_calls,
            max_runtime,
        })
    }

    /// Run until recycled, signalled or a fatal IPC threshold is crossed
    pub fn run(&mut self) -> Result<()> {
        signals::reset();
        signals::install(&WORKER_SIGNALS).map_err(MediatorError::Signal)?;

        if let Err(e) = self.registry.run_setup() {
            error!("Worker {} setup failed: {}", self.pid, e);
            return Err(MediatorError::Environment(vec![e]));
        }
        info!(alias = %self.config.alias, pid = self.pid, "Worker process started");

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let result = loop {
            if signals::shutdown_requested() {
                info!(pid = self.pid, "Worker shutting down");
                break Ok(());
            }
            if self.should_recycle() {
                info!(pid = self.pid, processed = self.processed, "Recycling worker");
                break Ok(());
            }

            if rand::thread_rng().gen_range(1..=5) == 1 {
                self.garbage_collect();
            }
            if signals::take(Signal::SIGUSR1) {
                self.dump();
            }

            let received = self.channel.receive(MessageType::Call, true);
            match received {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.handle(envelope) {
                        if e.is_fatal() {
                            break Err(e);
                        }
                        error!(pid = self.pid, "{}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    if let Err(fatal) = self.handle_ipc_error(&e, 1) {
                        break Err(fatal);
                    }
                }
            }

            std::thread::sleep(poll_interval);
        };

        if let Err(e) = self.registry.run_teardown() {
            warn!("Worker {} teardown failed: {}", self.pid, e);
        }
        result
    }

    fn should_recycle(&self) -> bool {
        let runtime = self.started.elapsed();
        let min_runtime = Duration::from_secs(self.config.recycle.min_runtime_secs);
        runtime >= self.max_runtime || (runtime >= min_runtime && self.processed >= self.max_calls)
    }

    /// Execute one dispatched call
    fn handle(&mut self, envelope: Envelope) -> Result<()> {
        let id = envelope.call_id;
        let mut call = self.decode(id)?;

        if call.is_stale_dispatch(envelope.microtime) {
            debug!("Call {} was re-dispatched; skipping stale message", id);
            // Local copy only; the record belongs to the newer attempt
            call.advance(CallStatus::Cancelled)?;
            self.calls.insert(id, call);
            return Ok(());
        }
        if call.status != CallStatus::Called {
            info!("Call {} is {} -- skipping", id, call.status);
            return Ok(());
        }

        call.pid = Some(self.pid);
        call.advance(CallStatus::Running)?;
        if !self.encode(&mut call)? {
            warn!("Call {} could not ack running", id);
        }

        let executor = CallExecutor::new(self.registry);
        let args = call.args.clone().unwrap_or_default();
        call.ret = Some(executor.execute(id, &call.method, &args));
        call.advance(CallStatus::Returned)?;

        call.size = Some(match call.to_bytes() {
            Ok(bytes) => bytes.len(),
            Err(CallError::PayloadTooLarge { max, actual }) => {
                warn!("Call {} returned {} bytes, above the {} byte limit", id, actual, max);
                call.ret = Some(Err(format!(
                    "Return value too large: {} bytes (limit {})",
                    actual, max
                )));
                call.to_bytes()?.len()
            }
            Err(e) => return Err(e.into()),
        });

        if !self.encode(&mut call)? {
            warn!("Call {} could not ack complete", id);
        }

        self.processed += 1;
        self.calls.insert(id, call);
        Ok(())
    }

    /// Reread a record, treating a missing slot as a shared memory fault
    fn decode(&mut self, id: CallId) -> Result<Call> {
        let mut tries = 1;
        loop {
            let err = match self.store.get_call(id) {
                Ok(Some(call)) => return Ok(call),
                Ok(None) => IpcError::Corrupt {
                    address: id,
                    reason: "record missing".to_string(),
                },
                Err(e) => e,
            };

            let retry = self.handle_ipc_error(&err, tries)?;
            if !retry || tries >= MAX_ENCODE_ATTEMPTS {
                return Err(MediatorError::Dispatch {
                    id,
                    reason: format!("could not decode message: {}", err),
                });
            }
            tries += 1;
        }
    }

    /// Write the record, then announce it. False when every attempt failed.
    fn encode(&mut self, call: &mut Call) -> Result<bool> {
        let Some((message_type, envelope)) = Envelope::for_call(call, self.pid) else {
            return Ok(false);
        };

        loop {
            let sent = self
                .store
                .put_call(call)
                .and_then(|_| self.channel.send(message_type, &envelope));
            let err = match sent {
                Ok(()) => return Ok(true),
                Err(e) => e,
            };

            call.errors += 1;
            let retry = self.handle_ipc_error(&err, call.errors)?;
            if !retry || call.errors >= MAX_ENCODE_ATTEMPTS {
                return Ok(false);
            }
        }
    }

    /// Worker-side IPC error policy: back off and reattach; the parent owns
    /// every corruption diagnostic.
    pub fn handle_ipc_error(&mut self, err: &IpcError, attempt: u32) -> Result<bool> {
        let class = ErrorClass::classify(err);
        let base = Duration::from_millis(match class {
            ErrorClass::Communication => self.config.backoff.worker_communication_base_ms,
            ErrorClass::Transient => self.config.backoff.parent_base_ms,
            _ => self.config.backoff.worker_base_ms,
        });

        match class {
            ErrorClass::Ignore => Ok(true),
            ErrorClass::Transient => {
                std::thread::sleep(backoff(base, attempt));
                Ok(true)
            }
            ErrorClass::Communication | ErrorClass::Corruption => {
                warn!(pid = self.pid, "IPC {} error: {}", class, err);
                self.count(class)?;
                std::thread::sleep(backoff(base, attempt));
                self.reattach();
                Ok(true)
            }
            ErrorClass::Catchall => {
                warn!(pid = self.pid, "IPC error: {}", err);
                std::thread::sleep(backoff(base, attempt));
                self.count(class)?;
                self.reattach();
                Ok(false)
            }
        }
    }

    fn count(&mut self, class: ErrorClass) -> Result<()> {
        let count = self.errors.increment(class);
        if self.errors.exceeded(class, &self.thresholds) {
            error!(pid = self.pid, "IPC '{}' error threshold reached", class);
            return Err(MediatorError::Threshold { class, count });
        }
        debug!(pid = self.pid, "Incrementing {} error count to {}", class, count);
        Ok(())
    }

    fn reattach(&mut self) {
        if let Err(e) = self.store.reattach() {
            warn!(pid = self.pid, "Work Store reattach failed: {}", e);
        }
        if let Err(e) = self.channel.reopen() {
            warn!(pid = self.pid, "Queue reopen failed: {}", e);
        }
    }

    /// Drop local copies of finished calls
    pub fn garbage_collect(&mut self) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, call| !call.status.is_terminal());
        before - self.calls.len()
    }

    fn dump(&self) {
        info!(
            alias = %self.config.alias,
            pid = self.pid,
            processed = self.processed,
            uptime_secs = self.started.elapsed().as_secs(),
            communication = self.errors.communication,
            corruption = self.errors.corruption,
            catchall = self.errors.catchall,
            "Worker runtime statistics"
        );
    }
}
