//! Parent side of a worker pool.
//!
//! The `Mediator` turns `invoke` calls into Work Store records plus
//! dispatch envelopes, keeps the pool of forked workers at the size the
//! forking strategy asks for, and folds the workers' acks back into its
//! local call table. Everything here runs on the supervisor's thread, one
//! pump at a time.

use crate::config::{ForkingStrategy, PoolConfig};
use crate::error::{MediatorError, Result};
use crate::executor::CallExecutor;
use crate::handler::HandlerRegistry;
use crate::hook::{NoopHook, ProtocolHook, ProtocolStep};
use crate::ipc_error::{backoff, ErrorClass, ErrorCounts, Role, Thresholds};
use crate::process::{
    analyze_wait_status, CrashLoopGuard, ForkLauncher, Launcher, Spawned, TerminationReason,
    WorkerProcess,
};
use crate::stats::{method_stats, PoolStats};
use crate::worker::WorkerRuntime;
use chrono::{DateTime, Utc};
use mediator_core::{Call, CallError, CallId, CallReturn, CallStatus, FIRST_CALL_ID, HEADER_ADDRESS};
use mediator_ipc::{Envelope, IpcError, MessageType, NotificationChannel, WorkStore};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Dispatch and record reads give up after this many failed attempts
const MAX_IPC_ATTEMPTS: u32 = 3;

/// Dropped calls are resubmitted until `retries` goes past this
const MAX_RETRIES: u32 = 3;

/// Launch failures tolerated per requested fork
const MAX_FORK_RETRIES: u32 = 3;

/// Addresses at or above this are canary probes, never call records
const CANARY_FLOOR: u64 = 1 << 40;

/// What to do with a call after its timeout handler ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    Retry,
    Ignore,
}

type ReturnHandler = Box<dyn FnMut(&Call)>;
type TimeoutHandler = Box<dyn FnMut(&Call) -> TimeoutAction>;

#[derive(Debug)]
struct Teardown {
    started: Instant,
    killed: bool,
}

pub struct Mediator {
    config: PoolConfig,
    registry: HandlerRegistry,
    store: WorkStore,
    channel: NotificationChannel,
    launcher: Box<dyn Launcher>,
    hook: Box<dyn ProtocolHook>,

    calls: BTreeMap<CallId, Call>,
    running_calls: BTreeSet<CallId>,
    processes: HashMap<Pid, WorkerProcess>,
    call_count: CallId,
    /// Imported Returned records whose ack may still be queued
    recovered: BTreeSet<CallId>,
    /// Acks a hook held back, replayed on the next pump
    deferred: Vec<(MessageType, Envelope)>,

    errors: ErrorCounts,
    thresholds: Thresholds,
    crash_guard: CrashLoopGuard,

    on_return: Option<ReturnHandler>,
    on_timeout: Option<TimeoutHandler>,

    pid: i32,
    last_gc: Instant,
    memory_warned: bool,
    diagnosing: bool,
    teardown: Option<Teardown>,
}

impl Mediator {
    /// Provision (or, in recovery mode, reattach to) the pool's IPC resources.
    ///
    /// No process is forked until `start` or the first `invoke`.
    pub fn new(config: PoolConfig, registry: HandlerRegistry) -> Result<Self> {
        config.validate().map_err(MediatorError::Config)?;

        let name = config.resource_name();
        if !config.recover {
            WorkStore::unlink(&name)?;
            NotificationChannel::unlink(&name)?;
        }
        let store = WorkStore::attach(&name, config.memory_allocation)?;
        let channel = NotificationChannel::open(&name, config.queue_depth)?;

        let mut mediator = Mediator {
            thresholds: Thresholds::for_role(Role::Parent),
            config,
            registry,
            store,
            channel,
            launcher: Box::new(ForkLauncher),
            hook: Box::new(NoopHook),
            calls: BTreeMap::new(),
            running_calls: BTreeSet::new(),
            processes: HashMap::new(),
            call_count: HEADER_ADDRESS,
            recovered: BTreeSet::new(),
            deferred: Vec::new(),
            errors: ErrorCounts::default(),
            crash_guard: CrashLoopGuard::default(),
            on_return: None,
            on_timeout: None,
            pid: std::process::id() as i32,
            last_gc: Instant::now(),
            memory_warned: false,
            diagnosing: false,
            teardown: None,
        };

        if mediator.config.recover {
            mediator.recover()?;
        }
        info!(
            alias = %mediator.config.alias,
            workers = mediator.config.workers,
            strategy = ?mediator.config.strategy(),
            "Worker pool initialized"
        );
        Ok(mediator)
    }

    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_hook(mut self, hook: Box<dyn ProtocolHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Called with each call that reaches Returned
    pub fn on_return<F: FnMut(&Call) + 'static>(&mut self, handler: F) {
        self.on_return = Some(Box::new(handler));
    }

    /// Called with each call that reaches TimedOut
    pub fn on_timeout<F: FnMut(&Call) -> TimeoutAction + 'static>(&mut self, handler: F) {
        self.on_timeout = Some(Box::new(handler));
    }

    pub fn alias(&self) -> &str {
        &self.config.alias
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Validate the environment and pre-fork when the strategy calls for it
    pub fn start(&mut self) -> Result<()> {
        let errors = self.registry.check_environment();
        if !errors.is_empty() {
            for e in &errors {
                error!(alias = %self.config.alias, "Environment check failed: {}", e);
            }
            return Err(MediatorError::Environment(errors));
        }

        if self.config.strategy() == ForkingStrategy::Aggressive {
            self.fork()?;
        }
        Ok(())
    }

    /// Import every decodable record left in the Work Store by a previous run
    fn recover(&mut self) -> Result<()> {
        for address in self.store.addresses()? {
            if address == HEADER_ADDRESS {
                continue;
            }
            if address >= CANARY_FLOOR {
                self.store.remove(address)?;
                continue;
            }

            match self.store.get_call(address) {
                Ok(Some(call)) => {
                    match call.status {
                        CallStatus::Running => {
                            self.running_calls.insert(call.id);
                        }
                        CallStatus::Returned => {
                            self.recovered.insert(call.id);
                        }
                        _ => {}
                    }
                    self.call_count = self.call_count.max(call.id);
                    self.calls.insert(call.id, call);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Removing undecodable record at address {}: {}", address, e);
                    self.store.remove(address)?;
                }
            }
        }

        info!(
            alias = %self.config.alias,
            "Recovered {} calls, resuming at call id {}",
            self.calls.len(),
            self.call_count + 1
        );
        Ok(())
    }

    /// Submit a call to the pool, returning its id once it is dispatched
    pub fn invoke(&mut self, method: &str, args: Vec<Value>) -> Result<CallId> {
        if !self.registry.has_handler(method) {
            return Err(CallError::UnknownMethod(method.to_string()).into());
        }

        self.call_count = self.call_count.max(FIRST_CALL_ID - 1) + 1;
        let id = self.call_count;
        self.calls.insert(id, Call::new(id, method, args));
        self.dispatch(id)
    }

    /// Run a registered handler synchronously in this process
    pub fn inline(&self, method: &str, args: &[Value]) -> CallReturn {
        CallExecutor::new(&self.registry).execute(0, method, args)
    }

    /// Resubmit a finished, cancelled or timed out call
    pub fn retry(&mut self, id: CallId) -> Result<CallId> {
        let call = self
            .calls
            .get_mut(&id)
            .ok_or(CallError::CallNotFound(id))?;
        call.resubmit()?;
        info!("Retrying call {} (attempt {})", id, call.retries + 1);
        self.dispatch(id)
    }

    /// Cancel a call that has not finished.
    ///
    /// An Uncalled or Called record is rewritten so a worker that receives
    /// it skips it. A Running call takes its worker process down with it.
    pub fn cancel(&mut self, id: CallId) -> Result<()> {
        let status = self
            .calls
            .get(&id)
            .map(|c| c.status)
            .ok_or(CallError::CallNotFound(id))?;

        match status {
            CallStatus::Uncalled | CallStatus::Called => {
                let call = self.calls.get_mut(&id).ok_or(CallError::CallNotFound(id))?;
                call.advance(CallStatus::Cancelled)?;
                if let Err(e) = self.store.put_call(call) {
                    warn!("Call {}: could not write cancellation: {}", id, e);
                }
            }
            CallStatus::Running => {
                self.terminate_owner(id);
                self.running_calls.remove(&id);
                if let Some(call) = self.calls.get_mut(&id) {
                    call.advance(CallStatus::Cancelled)?;
                }
            }
            other => {
                return Err(CallError::InvalidTransition {
                    id,
                    from: other,
                    to: CallStatus::Cancelled,
                }
                .into())
            }
        }
        info!("Call {} cancelled", id);
        Ok(())
    }

    pub fn status(&self, id: CallId) -> Option<CallStatus> {
        self.calls.get(&id).map(|c| c.status)
    }

    pub fn get(&self, id: CallId) -> Option<&Call> {
        self.calls.get(&id)
    }

    /// Whether a worker slot is free
    pub fn is_idle(&self) -> bool {
        self.config.workers > self.running_calls.len()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    pub fn running_count(&self) -> usize {
        self.running_calls.len()
    }

    /// Calls dispatched but not yet picked up by a worker
    pub fn queued_count(&self) -> usize {
        self.calls
            .values()
            .filter(|c| c.status == CallStatus::Called)
            .count()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.keys().copied().collect()
    }

    /// Write the record, then send the dispatch envelope
    fn dispatch(&mut self, id: CallId) -> Result<CallId> {
        {
            let call = self.calls.get_mut(&id).ok_or(CallError::CallNotFound(id))?;
            if !self.hook.before(ProtocolStep::Encode, Some(&*call)) {
                return Err(MediatorError::Vetoed(ProtocolStep::Encode));
            }
            call.advance(CallStatus::Called)?;
        }

        loop {
            let call = self.calls.get(&id).ok_or(CallError::CallNotFound(id))?;
            let Some((message_type, envelope)) = Envelope::for_call(call, self.pid) else {
                break;
            };
            let sent = self
                .store
                .put_call(call)
                .and_then(|_| self.channel.send(message_type, &envelope));
            let err = match sent {
                Ok(()) => {
                    debug!("Call {} dispatched to `{}`", id, call.method);
                    break;
                }
                Err(e) => e,
            };

            let attempt = match self.calls.get_mut(&id) {
                Some(call) => {
                    call.errors += 1;
                    call.errors
                }
                None => MAX_IPC_ATTEMPTS,
            };
            let retry = match self.handle_ipc_error(&err, attempt) {
                Ok(retry) => retry,
                Err(fatal) => {
                    self.roll_back(id);
                    return Err(fatal);
                }
            };
            if !retry || attempt >= MAX_IPC_ATTEMPTS {
                error!("Call {}: dispatch failed after {} attempts: {}", id, attempt, err);
                self.roll_back(id);
                return Err(MediatorError::Dispatch {
                    id,
                    reason: err.to_string(),
                });
            }
        }

        self.fork()?;
        Ok(id)
    }

    /// Empty the call's slot and cancel it after a failed dispatch
    fn roll_back(&mut self, id: CallId) {
        if let Err(e) = self.store.remove(id) {
            warn!("Call {}: could not roll back record: {}", id, e);
        }
        if let Some(call) = self.calls.get_mut(&id) {
            if let Err(e) = call.advance(CallStatus::Cancelled) {
                warn!("Call {}: could not cancel after failed dispatch: {}", id, e);
            }
        }
    }

    /// Fork as many workers as the forking strategy wants right now
    pub fn fork(&mut self) -> Result<usize> {
        let wanted = self.fork_count();
        let mut forked = 0;
        for _ in 0..wanted {
            if self.fork_one()? {
                forked += 1;
            }
        }
        Ok(forked)
    }

    fn fork_count(&self) -> usize {
        let processes = self.processes.len();
        match self.config.strategy() {
            ForkingStrategy::Lazy => {
                if processes >= self.config.workers || processes > self.running_calls.len() {
                    0
                } else if self.calls.is_empty() && self.pending_messages() == 0 {
                    0
                } else {
                    1
                }
            }
            ForkingStrategy::Mixed | ForkingStrategy::Aggressive => {
                self.config.workers.saturating_sub(processes)
            }
        }
    }

    fn fork_one(&mut self) -> Result<bool> {
        if !self.hook.before(ProtocolStep::Fork, None) {
            debug!(alias = %self.config.alias, "Fork skipped by protocol hook");
            return Ok(false);
        }

        let mut failures = 0;
        loop {
            match self.launcher.launch() {
                Ok(Spawned::Parent(pid)) => {
                    info!(alias = %self.config.alias, "Forked worker process {}", pid);
                    self.processes.insert(pid, WorkerProcess::new(pid));
                    return Ok(true);
                }
                Ok(Spawned::Child) => self.become_worker(),
                Err(errno) => {
                    failures += 1;
                    if failures > MAX_FORK_RETRIES {
                        error!(alias = %self.config.alias, "Could not fork: {}", errno);
                        return Err(MediatorError::Fork(errno));
                    }
                    warn!("Fork failed ({}), retrying: {}", failures, errno);
                    std::thread::sleep(backoff(
                        Duration::from_millis(self.config.backoff.parent_base_ms),
                        failures,
                    ));
                }
            }
        }
    }

    /// Turn the freshly forked child into a worker and never return
    fn become_worker(&self) -> ! {
        let run = catch_unwind(AssertUnwindSafe(|| {
            WorkerRuntime::new(&self.config, &self.registry).and_then(|mut worker| worker.run())
        }));
        let code = match run {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                error!(alias = %self.config.alias, "Worker exiting: {}", e);
                1
            }
            Err(_) => {
                error!(alias = %self.config.alias, "Worker panicked");
                101
            }
        };
        // SAFETY: the forked child must not run atexit handlers or the
        // parent's destructors; _exit only ends the process.
        unsafe { nix::libc::_exit(code) }
    }

    /// Non-blocking reap of every exited worker
    pub fn reap_exited(&mut self) -> Result<Vec<(Pid, TerminationReason)>> {
        let pids: Vec<Pid> = self.processes.keys().copied().collect();
        let mut reaped = Vec::new();

        for pid in pids {
            let Some(process) = self.processes.get(&pid) else {
                continue;
            };
            let status = match process.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => status,
                Err(Errno::ECHILD) => {
                    warn!("Worker {} is not our child; forgetting it", pid);
                    self.processes.remove(&pid);
                    continue;
                }
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    continue;
                }
            };
            reaped.push((pid, self.reap(pid, status)?));
        }
        Ok(reaped)
    }

    /// Forget an exited worker, counting it toward the crash-loop guard
    pub fn reap(&mut self, pid: Pid, status: WaitStatus) -> Result<TerminationReason> {
        let reason = analyze_wait_status(status);
        let Some(process) = self.processes.remove(&pid) else {
            return Ok(reason);
        };

        if reason.is_success() {
            info!(alias = %self.config.alias, "Worker {} {}", pid, reason);
        } else {
            warn!(alias = %self.config.alias, "Worker {} {}", pid, reason);
        }

        if self.teardown.is_none() {
            if let Err(deaths) = self.crash_guard.record_exit(process.forked_at, Instant::now()) {
                error!(
                    alias = %self.config.alias,
                    "{} recently forked processes died; giving up", deaths
                );
                return Err(MediatorError::CrashLoop(deaths));
            }
        }
        Ok(reason)
    }

    /// Fold pending acks into the call table, enforce timeouts and top up
    /// the pool. Called by the supervisor before each tick.
    pub fn pump(&mut self) -> Result<()> {
        if self.calls.is_empty() {
            return Ok(());
        }

        self.receive_acks(MessageType::Running)?;
        self.receive_acks(MessageType::Return)?;
        self.enforce_timeouts()?;

        match self.config.strategy() {
            ForkingStrategy::Aggressive => {
                self.fork()?;
            }
            _ if self.processes.is_empty() && self.pending_messages() > 0 => {
                self.fork()?;
            }
            _ => {}
        }
        Ok(())
    }

    fn receive_acks(&mut self, message_type: MessageType) -> Result<()> {
        let (held, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|(t, _)| *t == message_type);
        self.deferred = rest;

        let mut replay: VecDeque<Envelope> = held.into_iter().map(|(_, e)| e).collect();
        let result = self.drain_acks(message_type, &mut replay);
        self.deferred
            .extend(replay.into_iter().map(|envelope| (message_type, envelope)));
        result
    }

    /// Process held-back acks first, then whatever is queued
    fn drain_acks(&mut self, message_type: MessageType, replay: &mut VecDeque<Envelope>) -> Result<()> {
        let mut attempts = 0;
        loop {
            let next = match replay.pop_front() {
                Some(envelope) => Ok(Some(envelope)),
                None => self.channel.receive(message_type, false),
            };
            let envelope = match next {
                Ok(Some(envelope)) => envelope,
                Ok(None) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if !self.handle_ipc_error(&e, attempts)? || attempts >= MAX_IPC_ATTEMPTS {
                        return Ok(());
                    }
                    continue;
                }
            };

            if !self.hook.before(ProtocolStep::Decode, self.calls.get(&envelope.call_id)) {
                debug!("Call {}: {} ack held back by protocol hook", envelope.call_id, message_type.suffix());
                self.deferred.push((message_type, envelope));
                continue;
            }
            if message_type == MessageType::Running
                && self.calls.get(&envelope.call_id).is_some_and(|c| c.status.is_terminal())
            {
                debug!("Call {} already finished; dropping running ack", envelope.call_id);
                continue;
            }
            let Some(stored) = self.decode(envelope.call_id)? else {
                continue;
            };

            match message_type {
                MessageType::Running => self.accept_running(stored, envelope.microtime),
                MessageType::Return => self.accept_return(stored, envelope.microtime),
                MessageType::Call => Ok(()),
            }?;
        }
    }

    /// Reread a record; a missing slot is treated as a shared memory fault
    fn decode(&mut self, id: CallId) -> Result<Option<Call>> {
        let mut tries = 0;
        loop {
            tries += 1;
            let err = match self.store.get_call(id) {
                Ok(Some(call)) => return Ok(Some(call)),
                Ok(None) => IpcError::Corrupt {
                    address: id,
                    reason: "record missing".to_string(),
                },
                Err(e) => e,
            };

            let retry = self.handle_ipc_error(&err, tries)?;
            if !retry || tries >= MAX_IPC_ATTEMPTS {
                error!("Call {}: could not decode record: {}", id, err);
                return Ok(None);
            }
        }
    }

    fn accept_running(&mut self, stored: Call, acked_at: DateTime<Utc>) -> Result<()> {
        let id = stored.id;
        let pid = stored.pid;

        match self.calls.get_mut(&id) {
            Some(call) if call.status.is_terminal() => {
                debug!("Call {} is already {}; ignoring running ack", id, call.status);
                return Ok(());
            }
            Some(call) => {
                if call.status == CallStatus::Called {
                    call.advance_at(CallStatus::Running, stored.time.running.unwrap_or(acked_at))?;
                }
                call.pid = pid;
            }
            None => {
                debug!("Call {} unknown locally; adopting stored record", id);
                self.call_count = self.call_count.max(id);
                self.calls.insert(id, stored);
            }
        }

        self.running_calls.insert(id);
        if let Some(process) = pid.and_then(|p| self.processes.get_mut(&Pid::from_raw(p))) {
            process.job = Some(id);
        }
        debug!("Call {} running in worker {:?}", id, pid);
        Ok(())
    }

    fn accept_return(&mut self, stored: Call, acked_at: DateTime<Utc>) -> Result<()> {
        let id = stored.id;
        if stored.status != CallStatus::Returned {
            warn!("Call {}: return ack for a {} record", id, stored.status);
            return Ok(());
        }
        if let Err(e) = self.store.remove(id) {
            warn!("Call {}: could not free slot: {}", id, e);
        }

        let recovered = self.recovered.remove(&id);
        let call = self.calls.entry(id).or_insert_with(|| stored.clone());
        if call.status.is_terminal() && !recovered {
            debug!("Call {} is already {}; ignoring return ack", id, call.status);
            return Ok(());
        }
        if call.status == CallStatus::Called {
            call.advance_at(CallStatus::Running, stored.time.running.unwrap_or(acked_at))?;
        }
        if call.status == CallStatus::Running {
            call.advance_at(CallStatus::Returned, stored.time.returned.unwrap_or(acked_at))?;
        }
        call.pid = stored.pid;
        call.ret = stored.ret;
        call.size = stored.size;
        self.running_calls.remove(&id);

        let size = call.size.unwrap_or(0);
        if call.is_error() {
            warn!("Call {} to `{}` returned an error", id, call.method);
        } else {
            debug!("Call {} to `{}` returned", id, call.method);
        }
        if let Some(handler) = self.on_return.as_mut() {
            handler(&*call);
        }
        self.check_memory(size);
        Ok(())
    }

    /// Warn once when records get large relative to the Work Store
    fn check_memory(&mut self, size: usize) {
        if self.memory_warned {
            return;
        }
        let limit = self.config.memory_allocation as f64 * self.config.memory_warning_fraction;
        if size as f64 > limit {
            warn!(
                alias = %self.config.alias,
                "Call record of {} bytes is large for a {} byte Work Store; consider a memory allocation of at least {} bytes",
                size,
                self.config.memory_allocation,
                size * 60
            );
            self.memory_warned = true;
        }
    }

    fn enforce_timeouts(&mut self) -> Result<()> {
        let Some(timeout) = self.config.timeout() else {
            return Ok(());
        };
        let now = Utc::now();
        let expired: Vec<CallId> = self
            .running_calls
            .iter()
            .copied()
            .filter(|id| {
                self.calls
                    .get(id)
                    .and_then(|call| call.running_for(now))
                    .and_then(|elapsed| elapsed.to_std().ok())
                    .is_some_and(|elapsed| elapsed > timeout)
            })
            .collect();

        for id in expired {
            self.time_out(id)?;
        }
        Ok(())
    }

    fn time_out(&mut self, id: CallId) -> Result<()> {
        self.terminate_owner(id);
        self.running_calls.remove(&id);

        let Some(call) = self.calls.get_mut(&id) else {
            return Ok(());
        };
        call.advance(CallStatus::TimedOut)?;
        warn!(alias = %self.config.alias, "Call {} to `{}` timed out", id, call.method);

        let action = match self.on_timeout.as_mut() {
            Some(handler) => handler(&*call),
            None => TimeoutAction::Ignore,
        };
        if action == TimeoutAction::Retry {
            if let Err(e) = self.retry(id) {
                if e.is_fatal() {
                    return Err(e);
                }
                error!("Call {}: retry after timeout failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// SIGKILL and reap the worker running `id`, if it is one of ours
    fn terminate_owner(&mut self, id: CallId) {
        let Some(pid) = self.calls.get(&id).and_then(|c| c.pid).map(Pid::from_raw) else {
            return;
        };
        let Some(process) = self.processes.remove(&pid) else {
            return;
        };

        warn!("Killing worker {} running call {}", pid, id);
        match process.kill_and_reap() {
            Ok(status) => debug!("Worker {} {}", pid, analyze_wait_status(status)),
            Err(e) => warn!("Could not reap worker {}: {}", pid, e),
        }
    }

    /// Throttled housekeeping for quiet ticks
    pub fn on_idle(&mut self) -> Result<()> {
        if self.last_gc.elapsed() < self.config.gc_interval() {
            return Ok(());
        }
        self.last_gc = Instant::now();
        self.garbage_collect()?;
        Ok(())
    }

    /// Purge finished calls and resubmit dropped ones.
    ///
    /// Returns the number of calls purged.
    pub fn garbage_collect(&mut self) -> Result<usize> {
        let mut purged = 0;
        for call in self.calls.values_mut() {
            if self.recovered.contains(&call.id) || !call.purge() {
                continue;
            }
            if let Err(e) = self.store.remove(call.id) {
                warn!("Call {}: could not free slot: {}", call.id, e);
            }
            purged += 1;
        }
        if purged > 0 {
            debug!(alias = %self.config.alias, "Purged {} calls", purged);
        }

        for id in self.dropped_calls() {
            self.recover_dropped(id)?;
        }
        Ok(purged)
    }

    /// Called records older than anything a live worker has picked up
    fn dropped_calls(&self) -> Vec<CallId> {
        let called: Vec<(CallId, DateTime<Utc>)> = self
            .calls
            .values()
            .filter(|c| c.status == CallStatus::Called)
            .filter_map(|c| c.time.called.map(|t| (c.id, t)))
            .collect();
        let Some(mut cutoff) = called.iter().map(|(_, t)| *t).max() else {
            return Vec::new();
        };

        let grace = self.config.first_ack_grace();
        if self
            .processes
            .values()
            .any(|p| p.job.is_none() && p.forked_at.elapsed() < grace)
        {
            return Vec::new();
        }

        let oldest_job = self
            .processes
            .values()
            .filter_map(|p| p.job)
            .filter_map(|job| self.calls.get(&job))
            .filter_map(|c| c.time.called)
            .min();
        if let Some(oldest) = oldest_job {
            cutoff = cutoff.min(oldest);
        }

        let now = Utc::now();
        called
            .into_iter()
            .filter(|(_, at)| *at <= cutoff)
            .filter(|(_, at)| (now - *at).to_std().is_ok_and(|age| age >= grace))
            .map(|(id, _)| id)
            .collect()
    }

    fn recover_dropped(&mut self, id: CallId) -> Result<()> {
        let stored = match self.store.get_call(id) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Call {}: could not reread dropped call: {}", id, e);
                None
            }
        };
        let called_at = self.calls.get(&id).and_then(|c| c.time.called);

        if let Some(stored) = stored.filter(|s| s.time.called == called_at) {
            match stored.status {
                CallStatus::Running => {
                    info!("Call {}: adopting lost running ack", id);
                    return self.accept_running(stored, Utc::now());
                }
                CallStatus::Returned => {
                    info!("Call {}: adopting lost return ack", id);
                    self.accept_running(stored.clone(), Utc::now())?;
                    return self.accept_return(stored, Utc::now());
                }
                _ => {}
            }
        }

        let retries = self.calls.get(&id).map_or(0, |c| c.retries);
        if retries > MAX_RETRIES {
            error!(
                alias = %self.config.alias,
                "Call {} was dropped {} times; cancelling", id, retries + 1
            );
            if let Some(call) = self.calls.get_mut(&id) {
                call.advance(CallStatus::Cancelled)?;
            }
            if let Err(e) = self.store.remove(id) {
                warn!("Call {}: could not free slot: {}", id, e);
            }
            return Ok(());
        }

        warn!("Call {} appears to have been dropped; resubmitting", id);
        match self.retry(id) {
            Ok(_) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("Call {}: resubmission failed: {}", id, e);
                Ok(())
            }
        }
    }

    /// Parent-side IPC error policy.
    ///
    /// Returns whether the failed operation is worth retrying. Crossing an
    /// error threshold, or a Work Store that cannot be rebuilt, is fatal.
    pub fn handle_ipc_error(&mut self, err: &IpcError, attempt: u32) -> Result<bool> {
        let class = ErrorClass::classify(err);
        let delay = backoff(Duration::from_millis(self.config.backoff.parent_base_ms), attempt);

        match class {
            ErrorClass::Ignore => Ok(true),
            ErrorClass::Transient => {
                std::thread::sleep(delay);
                Ok(true)
            }
            ErrorClass::Communication => {
                warn!(alias = %self.config.alias, "IPC communication error: {}", err);
                self.count(class)?;
                std::thread::sleep(delay);
                self.reattach();
                Ok(true)
            }
            ErrorClass::Corruption => {
                warn!(alias = %self.config.alias, "IPC corruption error: {}", err);
                self.count(class)?;
                std::thread::sleep(delay);
                self.diagnose_shared_memory()?;
                Ok(true)
            }
            ErrorClass::Catchall => {
                warn!(alias = %self.config.alias, "IPC error: {}", err);
                std::thread::sleep(delay);
                self.count(class)?;
                self.reattach();
                Ok(false)
            }
        }
    }

    fn count(&mut self, class: ErrorClass) -> Result<()> {
        let count = self.errors.increment(class);
        if self.errors.exceeded(class, &self.thresholds) {
            error!(alias = %self.config.alias, "IPC '{}' error threshold reached", class);
            return Err(MediatorError::Threshold { class, count });
        }
        Ok(())
    }

    fn reattach(&mut self) {
        if let Err(e) = self.store.reattach() {
            warn!(alias = %self.config.alias, "Work Store reattach failed: {}", e);
        }
        if let Err(e) = self.channel.reopen() {
            warn!(alias = %self.config.alias, "Queue reopen failed: {}", e);
        }
    }

    /// Canary-test the Work Store and rebuild it if the probe fails,
    /// carrying over whatever records are still readable.
    fn diagnose_shared_memory(&mut self) -> Result<()> {
        if self.diagnosing || self.store.canary().is_ok() {
            return Ok(());
        }
        self.reattach();
        if self.store.canary().is_ok() {
            return Ok(());
        }

        self.diagnosing = true;
        let result = self.rebuild_store();
        self.diagnosing = false;
        result
    }

    fn rebuild_store(&mut self) -> Result<()> {
        warn!(alias = %self.config.alias, "Work Store failed the canary test; rebuilding");

        let mut to_copy = Vec::new();
        for address in self.store.addresses().unwrap_or_default() {
            if !(FIRST_CALL_ID..CANARY_FLOOR).contains(&address) {
                continue;
            }
            let timed_out = self.status(address) == Some(CallStatus::TimedOut);
            if let Ok(Some(call)) = self.store.get_call(address) {
                if !timed_out {
                    to_copy.push(call);
                }
            }
        }
        let to_call: Vec<CallId> = self
            .calls
            .values()
            .filter(|c| c.status == CallStatus::Uncalled)
            .map(|c| c.id)
            .collect();

        for _ in 0..2 {
            let rebuilt = self
                .store
                .recreate(self.config.memory_allocation)
                .and_then(|_| to_copy.iter().try_for_each(|c| self.store.put_call(c).map(|_| ())))
                .and_then(|_| self.store.canary());
            match rebuilt {
                Ok(()) => {
                    info!(
                        alias = %self.config.alias,
                        "Work Store rebuilt; {} records carried over", to_copy.len()
                    );
                    for id in to_call {
                        if let Err(e) = self.dispatch(id) {
                            error!("Call {}: dispatch after rebuild failed: {}", id, e);
                        }
                    }
                    return Ok(());
                }
                Err(e) if to_copy.is_empty() => {
                    error!(alias = %self.config.alias, "Work Store rebuild failed: {}", e);
                    return Err(MediatorError::SharedMemory);
                }
                Err(e) => {
                    warn!("Work Store rebuild with carried-over records failed ({}); retrying empty", e);
                    to_copy.clear();
                }
            }
        }
        Err(MediatorError::SharedMemory)
    }

    fn pending_messages(&self) -> usize {
        match self.channel.stats() {
            Ok(stats) => stats.total(),
            Err(e) => {
                warn!(alias = %self.config.alias, "Could not read queue stats: {}", e);
                0
            }
        }
    }

    /// One step of an orderly shutdown; true once every worker is gone.
    ///
    /// Workers get SIGTERM on the first step and SIGKILL once the grace
    /// period runs out. IPC resources are destroyed when nothing is
    /// pending, and kept for a recovery start otherwise.
    pub fn teardown(&mut self) -> Result<bool> {
        if self.teardown.is_none() {
            info!(alias = %self.config.alias, "Stopping {} workers", self.processes.len());
            for process in self.processes.values() {
                if let Err(e) = process.signal(Signal::SIGTERM) {
                    warn!("Could not signal worker {}: {}", process.pid, e);
                }
            }
            self.teardown = Some(Teardown {
                started: Instant::now(),
                killed: false,
            });
        }

        let kill_after = self
            .config
            .timeout()
            .map_or(Duration::from_secs(30), |t| t.min(Duration::from_secs(60)));
        if let Some(state) = self.teardown.as_mut() {
            if !state.killed && state.started.elapsed() >= kill_after && !self.processes.is_empty() {
                warn!(alias = %self.config.alias, "Workers ignored SIGTERM; sending SIGKILL");
                for process in self.processes.values() {
                    if let Err(e) = process.signal(Signal::SIGKILL) {
                        warn!("Could not kill worker {}: {}", process.pid, e);
                    }
                }
                state.killed = true;
            }
        }

        self.reap_exited()?;
        if !self.processes.is_empty() {
            return Ok(false);
        }

        let pending = self.pending_messages();
        if pending > 0 {
            info!(
                alias = %self.config.alias,
                "{} messages pending; preserving IPC resources for recovery", pending
            );
            return Ok(true);
        }
        if !self.hook.before(ProtocolStep::Destroy, None) {
            debug!(alias = %self.config.alias, "IPC destroy skipped by protocol hook");
            return Ok(true);
        }
        self.destroy_ipc()?;
        Ok(true)
    }

    /// Unlink the Work Store and the queues
    pub fn destroy_ipc(&mut self) -> Result<()> {
        self.store.destroy()?;
        self.channel.destroy()?;
        info!(alias = %self.config.alias, "IPC resources destroyed");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let mut by_status = BTreeMap::new();
        for call in self.calls.values() {
            *by_status.entry(call.status.as_str().to_string()).or_insert(0) += 1;
        }

        PoolStats {
            alias: self.config.alias.clone(),
            workers: self.config.workers,
            processes: self.processes.len(),
            running: self.running_calls.len(),
            calls: self.calls.len(),
            by_status,
            pending_messages: self.pending_messages(),
            early_deaths: self.crash_guard.early_deaths(),
            communication_errors: 0,
            corruption_errors: 0,
            catchall_errors: 0,
        }
        .with_errors(&self.errors)
    }

    /// Log pool and per-method statistics
    pub fn dump(&self) {
        let stats = self.stats();
        info!(
            alias = %stats.alias,
            processes = stats.processes,
            running = stats.running,
            calls = stats.calls,
            pending_messages = stats.pending_messages,
            early_deaths = stats.early_deaths,
            communication_errors = stats.communication_errors,
            corruption_errors = stats.corruption_errors,
            catchall_errors = stats.catchall_errors,
            "Pool statistics"
        );
        for method in method_stats(self.calls.values()) {
            info!(
                alias = %stats.alias,
                "{:<24} called mean {:>9.2}ms median {:>9.2}ms n={:<6} running mean {:>9.2}ms median {:>9.2}ms n={}",
                method.method,
                method.called.mean_ms,
                method.called.median_ms,
                method.called.count,
                method.running.mean_ms,
                method.running.median_ms,
                method.running.count
            );
        }
    }
}

impl Drop for Mediator {
    fn drop(&mut self) {
        for process in self.processes.values() {
            if let Err(e) = process.kill_and_reap() {
                debug!("Could not reap worker {} on drop: {}", process.pid, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::process::Command;
    use std::rc::Rc;

    /// Spawns placeholder processes that never talk to the pool
    struct CommandLauncher(&'static str, &'static [&'static str]);

    impl Launcher for CommandLauncher {
        fn launch(&mut self) -> nix::Result<Spawned> {
            let child = Command::new(self.0)
                .args(self.1)
                .spawn()
                .map_err(|_| Errno::EAGAIN)?;
            Ok(Spawned::Parent(Pid::from_raw(child.id() as i32)))
        }
    }

    fn sleeper() -> Box<dyn Launcher> {
        Box::new(CommandLauncher("sleep", &["30"]))
    }

    struct FailingLauncher;

    impl Launcher for FailingLauncher {
        fn launch(&mut self) -> nix::Result<Spawned> {
            Err(Errno::EAGAIN)
        }
    }

    struct Veto(ProtocolStep);

    impl ProtocolHook for Veto {
        fn before(&mut self, step: ProtocolStep, _call: Option<&Call>) -> bool {
            step != self.0
        }
    }

    /// Vetoes `step` the first `remaining` times it comes up
    struct VetoTimes {
        step: ProtocolStep,
        remaining: Rc<RefCell<u32>>,
    }

    impl ProtocolHook for VetoTimes {
        fn before(&mut self, step: ProtocolStep, _call: Option<&Call>) -> bool {
            let mut remaining = self.remaining.borrow_mut();
            if step != self.step || *remaining == 0 {
                return true;
            }
            *remaining -= 1;
            false
        }
    }

    fn config() -> PoolConfig {
        let mut config = PoolConfig::new(format!("m{}", uuid::Uuid::new_v4().simple()));
        config.daemon_id = "mediator-test".to_string();
        config.memory_allocation = 256 * 1024;
        config.forking_strategy = Some(ForkingStrategy::Lazy);
        config.first_ack_grace_secs = 0;
        config.backoff.parent_base_ms = 1;
        config
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .with("square", |args: &[Value]| -> CallReturn {
                let n = args.first().and_then(Value::as_i64).ok_or("expected integer")?;
                Ok(json!(n * n))
            })
            .unwrap()
    }

    fn unlink(config: &PoolConfig) {
        let name = config.resource_name();
        let _ = WorkStore::unlink(&name);
        let _ = NotificationChannel::unlink(&name);
    }

    /// Plays the worker side of the protocol from the test process
    struct FakeWorker {
        store: WorkStore,
        channel: NotificationChannel,
    }

    impl FakeWorker {
        fn attach(config: &PoolConfig) -> Self {
            let name = config.resource_name();
            FakeWorker {
                store: WorkStore::open(&name, config.memory_allocation).unwrap(),
                channel: NotificationChannel::open(&name, config.queue_depth).unwrap(),
            }
        }

        fn pick_up(&self, pid: Pid) -> Call {
            let envelope = self.channel.receive(MessageType::Call, false).unwrap().unwrap();
            let mut call = self.store.get_call(envelope.call_id).unwrap().unwrap();
            call.pid = Some(pid.as_raw());
            call.advance(CallStatus::Running).unwrap();
            self.ack(&call);
            call
        }

        fn finish(&self, mut call: Call, ret: CallReturn) {
            call.ret = Some(ret);
            call.advance(CallStatus::Returned).unwrap();
            call.size = Some(call.to_bytes().unwrap().len());
            self.ack(&call);
        }

        fn ack(&self, call: &Call) {
            self.store.put_call(call).unwrap();
            let (message_type, envelope) = Envelope::for_call(call, 1).unwrap();
            self.channel.send(message_type, &envelope).unwrap();
        }
    }

    #[test]
    fn test_invoke_dispatches_and_forks_lazily() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        mediator.start().unwrap();
        assert_eq!(mediator.process_count(), 0);

        let first = mediator.invoke("square", vec![json!(3)]).unwrap();
        let second = mediator.invoke("square", vec![json!(4)]).unwrap();
        assert_eq!((first, second), (FIRST_CALL_ID, FIRST_CALL_ID + 1));
        assert_eq!(mediator.status(first), Some(CallStatus::Called));
        assert_eq!(mediator.process_count(), 1);
        assert_eq!(mediator.stats().pending_messages, 2);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry()).unwrap();

        let err = mediator.invoke("cube", vec![json!(3)]).unwrap_err();
        assert!(matches!(err, MediatorError::Call(CallError::UnknownMethod(_))));
        assert_eq!(mediator.stats().calls, 0);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_acks_drive_the_call_to_returned() {
        let config = config();
        let returned = Rc::new(RefCell::new(Vec::new()));
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        let sink = Rc::clone(&returned);
        mediator.on_return(move |call| sink.borrow_mut().push(call.ret.clone()));

        let id = mediator.invoke("square", vec![json!(7)]).unwrap();
        let pid = mediator.pids()[0];
        let worker = FakeWorker::attach(&config);

        let call = worker.pick_up(pid);
        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Running));
        assert_eq!(mediator.running_count(), 1);
        assert!(!mediator.is_idle());

        worker.finish(call, Ok(json!(49)));
        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Returned));
        assert_eq!(mediator.running_count(), 0);
        assert_eq!(*returned.borrow(), vec![Some(Ok(json!(49)))]);
        assert!(!worker.store.has(id).unwrap());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_timeout_kills_the_owner() {
        let mut config = config();
        config.timeout_ms = 100;
        let timed_out = Rc::new(RefCell::new(Vec::new()));
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        let sink = Rc::clone(&timed_out);
        mediator.on_timeout(move |call| {
            sink.borrow_mut().push(call.id);
            TimeoutAction::Ignore
        });

        let id = mediator.invoke("square", vec![json!(2)]).unwrap();
        let pid = mediator.pids()[0];
        let worker = FakeWorker::attach(&config);
        worker.pick_up(pid);

        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Running));

        std::thread::sleep(Duration::from_millis(150));
        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::TimedOut));
        assert_eq!(*timed_out.borrow(), vec![id]);
        assert!(!mediator.pids().contains(&pid));
        assert_eq!(mediator.running_count(), 0);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_timeout_retry() {
        let mut config = config();
        config.timeout_ms = 50;
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        mediator.on_timeout(|_| TimeoutAction::Retry);

        let id = mediator.invoke("square", vec![json!(2)]).unwrap();
        let worker = FakeWorker::attach(&config);
        worker.pick_up(mediator.pids()[0]);
        mediator.pump().unwrap();

        std::thread::sleep(Duration::from_millis(100));
        mediator.pump().unwrap();

        let call = mediator.get(id).unwrap();
        assert_eq!(call.status, CallStatus::Called);
        assert_eq!(call.retries, 1);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_dropped_call_is_resubmitted_then_cancelled() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        let id = mediator.invoke("square", vec![json!(5)]).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        for attempt in 1..=MAX_RETRIES + 1 {
            mediator.garbage_collect().unwrap();
            let call = mediator.get(id).unwrap();
            assert_eq!(call.status, CallStatus::Called);
            assert_eq!(call.retries, attempt);
        }

        mediator.garbage_collect().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Cancelled));
        assert_eq!(mediator.process_count(), 1);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_fresh_worker_grace_defers_dropped_calls() {
        let mut config = config();
        config.first_ack_grace_secs = 60;
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        let id = mediator.invoke("square", vec![json!(5)]).unwrap();
        mediator.garbage_collect().unwrap();
        assert_eq!(mediator.get(id).unwrap().retries, 0);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_lost_return_ack_is_adopted() {
        let config = config();
        let returned = Rc::new(RefCell::new(0));
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        let sink = Rc::clone(&returned);
        mediator.on_return(move |_| *sink.borrow_mut() += 1);

        let id = mediator.invoke("square", vec![json!(6)]).unwrap();
        let worker = FakeWorker::attach(&config);
        let mut call = worker.pick_up(mediator.pids()[0]);
        call.ret = Some(Ok(json!(36)));
        call.advance(CallStatus::Returned).unwrap();
        worker.store.put_call(&call).unwrap();
        // Both acks are lost
        worker.channel.receive(MessageType::Running, false).unwrap();

        mediator.garbage_collect().unwrap();
        let call = mediator.get(id).unwrap();
        assert_eq!(call.status, CallStatus::Returned);
        assert_eq!(call.retries, 0);
        assert_eq!(call.ret, Some(Ok(json!(36))));
        assert_eq!(*returned.borrow(), 1);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_gc_is_idempotent() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        let id = mediator.invoke("square", vec![json!(5)]).unwrap();
        mediator.cancel(id).unwrap();

        assert_eq!(mediator.garbage_collect().unwrap(), 1);
        let once = mediator.get(id).unwrap().clone();
        assert!(once.gc);
        assert_eq!(once.args, None);
        assert_eq!(once.ret, None);
        assert!(!FakeWorker::attach(&config).store.has(id).unwrap());

        assert_eq!(mediator.garbage_collect().unwrap(), 0);
        assert_eq!(mediator.get(id).unwrap(), &once);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_cancelled_record_is_visible_to_workers() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        let id = mediator.invoke("square", vec![json!(5)]).unwrap();
        mediator.cancel(id).unwrap();

        let stored = FakeWorker::attach(&config).store.get_call(id).unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Cancelled);
        assert!(mediator.cancel(id).is_err());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_corruption_threshold_is_fatal() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry()).unwrap();
        let err = IpcError::Corrupt {
            address: 2,
            reason: "injected".to_string(),
        };

        for _ in 0..25 {
            assert!(mediator.handle_ipc_error(&err, 1).unwrap());
        }
        let fatal = mediator.handle_ipc_error(&err, 1).unwrap_err();
        assert!(matches!(
            fatal,
            MediatorError::Threshold { class: ErrorClass::Corruption, count: 26 }
        ));
        assert!(fatal.is_fatal());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_catchall_gives_up_on_the_operation() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry()).unwrap();
        let err = IpcError::Os {
            op: "mq_send",
            errno: Errno::EPERM,
        };

        assert!(!mediator.handle_ipc_error(&err, 1).unwrap());
        assert_eq!(mediator.stats().catchall_errors, 1);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_fork_failure_is_fatal() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(Box::new(FailingLauncher));

        let err = mediator.invoke("square", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, MediatorError::Fork(Errno::EAGAIN)));
        assert!(err.is_fatal());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_crash_loop_is_fatal() {
        let mut config = config();
        config.workers = 5;
        config.forking_strategy = Some(ForkingStrategy::Aggressive);
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(Box::new(CommandLauncher("true", &[])));

        mediator.start().unwrap();
        assert_eq!(mediator.process_count(), 5);

        let deadline = Instant::now() + Duration::from_secs(5);
        let err = loop {
            match mediator.reap_exited() {
                Err(e) => break e,
                Ok(_) if Instant::now() > deadline => panic!("workers never exited"),
                Ok(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        };
        assert!(matches!(err, MediatorError::CrashLoop(5)));

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_encode_veto() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper())
            .with_hook(Box::new(Veto(ProtocolStep::Encode)));

        let err = mediator.invoke("square", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, MediatorError::Vetoed(ProtocolStep::Encode)));
        assert_eq!(mediator.process_count(), 0);

        let id = FIRST_CALL_ID;
        assert_eq!(mediator.status(id), Some(CallStatus::Uncalled));
        mediator.cancel(id).unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Cancelled));

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_vetoed_ack_is_replayed() {
        let config = config();
        let remaining = Rc::new(RefCell::new(1));
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper())
            .with_hook(Box::new(VetoTimes {
                step: ProtocolStep::Decode,
                remaining: Rc::clone(&remaining),
            }));

        let id = mediator.invoke("square", vec![json!(8)]).unwrap();
        let worker = FakeWorker::attach(&config);
        let call = worker.pick_up(mediator.pids()[0]);
        worker.finish(call, Ok(json!(64)));

        // Running ack is held back, Return ack lands first
        mediator.pump().unwrap();
        assert_eq!(*remaining.borrow(), 0);
        assert_eq!(mediator.status(id), Some(CallStatus::Returned));

        mediator.pump().unwrap();
        mediator.garbage_collect().unwrap();
        let call = mediator.get(id).unwrap();
        assert_eq!(call.status, CallStatus::Returned);
        assert_eq!(call.ret, Some(Ok(json!(64))));
        assert_eq!(mediator.running_count(), 0);
        assert!(mediator.is_idle());
        assert!(mediator.deferred.is_empty());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_vetoed_return_ack_is_not_lost() {
        let config = config();
        let remaining = Rc::new(RefCell::new(0));
        let returned = Rc::new(RefCell::new(0));
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper())
            .with_hook(Box::new(VetoTimes {
                step: ProtocolStep::Decode,
                remaining: Rc::clone(&remaining),
            }));
        let sink = Rc::clone(&returned);
        mediator.on_return(move |_| *sink.borrow_mut() += 1);

        let id = mediator.invoke("square", vec![json!(9)]).unwrap();
        let worker = FakeWorker::attach(&config);
        let call = worker.pick_up(mediator.pids()[0]);
        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Running));

        worker.finish(call, Ok(json!(81)));
        *remaining.borrow_mut() = 1;
        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Running));
        assert_eq!(*returned.borrow(), 0);

        mediator.pump().unwrap();
        assert_eq!(mediator.status(id), Some(CallStatus::Returned));
        assert_eq!(*returned.borrow(), 1);
        assert!(mediator.is_idle());

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_fatal_dispatch_error_rolls_back_the_slot() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        let err = IpcError::Os {
            op: "mq_send",
            errno: Errno::EBADF,
        };
        for _ in 0..50 {
            assert!(mediator.handle_ipc_error(&err, 1).unwrap());
        }
        mediator.channel.destroy().unwrap();

        let fatal = mediator.invoke("square", vec![json!(4)]).unwrap_err();
        assert!(matches!(
            fatal,
            MediatorError::Threshold { class: ErrorClass::Communication, count: 51 }
        ));

        let id = FIRST_CALL_ID;
        assert_eq!(mediator.status(id), Some(CallStatus::Cancelled));
        assert!(!mediator.store.has(id).unwrap());
        assert_eq!(mediator.process_count(), 0);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_mixed_strategy_forks_whole_pool_on_first_call() {
        let mut config = config();
        config.workers = 3;
        config.forking_strategy = Some(ForkingStrategy::Mixed);
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());

        mediator.start().unwrap();
        assert_eq!(mediator.process_count(), 0);

        mediator.invoke("square", vec![json!(2)]).unwrap();
        assert_eq!(mediator.process_count(), 3);

        mediator.invoke("square", vec![json!(3)]).unwrap();
        assert_eq!(mediator.process_count(), 3);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_teardown_preserves_pending_messages() {
        let config = config();
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        mediator.invoke("square", vec![json!(1)]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !mediator.teardown().unwrap() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(mediator.process_count(), 0);

        let worker = FakeWorker::attach(&config);
        assert_eq!(worker.channel.stats().unwrap().call, 1);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_teardown_destroys_idle_ipc() {
        let mut config = config();
        config.forking_strategy = Some(ForkingStrategy::Aggressive);
        let mut mediator = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        mediator.start().unwrap();
        assert_eq!(mediator.process_count(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !mediator.teardown().unwrap() {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(20));
        }

        // A fresh segment has no header slot
        let worker = FakeWorker::attach(&config);
        assert_eq!(worker.store.read_header().unwrap(), None);

        drop(mediator);
        unlink(&config);
    }

    #[test]
    fn test_recovery_imports_records() {
        let config = config();
        let mut first = Mediator::new(config.clone(), registry())
            .unwrap()
            .with_launcher(sleeper());
        let a = first.invoke("square", vec![json!(1)]).unwrap();
        let b = first.invoke("square", vec![json!(2)]).unwrap();
        drop(first);

        let mut recovering = config.clone();
        recovering.recover = true;
        let mut second = Mediator::new(recovering, registry())
            .unwrap()
            .with_launcher(sleeper());
        assert_eq!(second.status(a), Some(CallStatus::Called));
        assert_eq!(second.status(b), Some(CallStatus::Called));
        assert_eq!(second.get(b).unwrap().args, Some(vec![json!(2)]));
        assert_eq!(second.invoke("square", vec![json!(3)]).unwrap(), b + 1);

        drop(second);
        unlink(&config);
    }

    #[test]
    fn test_inline() {
        let config = config();
        let mediator = Mediator::new(config.clone(), registry()).unwrap();

        assert_eq!(mediator.inline("square", &[json!(9)]), Ok(json!(81)));
        assert!(mediator.inline("cube", &[json!(9)]).is_err());

        drop(mediator);
        unlink(&config);
    }
}
