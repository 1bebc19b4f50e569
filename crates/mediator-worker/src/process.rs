//! Worker process bookkeeping: launching, crash-loop detection and
//! termination analysis.

use mediator_core::CallId;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::time::{Duration, Instant};

/// Which side of a launch the caller is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spawned {
    /// In the parent, with the new worker's pid
    Parent(Pid),
    /// In the freshly forked worker
    Child,
}

/// Creates worker processes
pub trait Launcher {
    fn launch(&mut self) -> nix::Result<Spawned>;
}

/// Forks the current process
pub struct ForkLauncher;

impl Launcher for ForkLauncher {
    fn launch(&mut self) -> nix::Result<Spawned> {
        // SAFETY: the child only runs the worker loop and leaves via _exit.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(Spawned::Parent(child)),
            ForkResult::Child => Ok(Spawned::Child),
        }
    }
}

/// Parent-side descriptor of a live worker
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    pub pid: Pid,
    pub forked_at: Instant,
    /// Last call this process acked
    pub job: Option<CallId>,
}

impl WorkerProcess {
    pub fn new(pid: Pid) -> Self {
        WorkerProcess {
            pid,
            forked_at: Instant::now(),
            job: None,
        }
    }

    /// Non-blocking reap; `None` while the process is still running
    pub fn try_wait(&self) -> nix::Result<Option<WaitStatus>> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(status)),
            Err(e) => Err(e),
        }
    }

    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// SIGKILL and reap, blocking until the process is gone
    pub fn kill_and_reap(&self) -> nix::Result<WaitStatus> {
        self.signal(Signal::SIGKILL)?;
        match waitpid(self.pid, None) {
            Err(Errno::ECHILD) => Ok(WaitStatus::Signaled(self.pid, Signal::SIGKILL, false)),
            other => other,
        }
    }
}

/// Counts processes that die shortly after being forked
#[derive(Debug)]
pub struct CrashLoopGuard {
    window: Duration,
    limit: u32,
    reset_after: Duration,
    early_deaths: u32,
    last_early_death: Option<Instant>,
}

impl Default for CrashLoopGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 5, Duration::from_secs(90))
    }
}

impl CrashLoopGuard {
    pub fn new(window: Duration, limit: u32, reset_after: Duration) -> Self {
        CrashLoopGuard {
            window,
            limit,
            reset_after,
            early_deaths: 0,
            last_early_death: None,
        }
    }

    /// Record the exit of a process forked at `forked_at`.
    ///
    /// Returns the early-death count once it reaches the limit.
    pub fn record_exit(&mut self, forked_at: Instant, now: Instant) -> Result<(), u32> {
        if let Some(last) = self.last_early_death {
            if now.duration_since(last) > self.reset_after {
                self.early_deaths = 0;
                self.last_early_death = None;
            }
        }

        if now.duration_since(forked_at) < self.window {
            self.early_deaths += 1;
            self.last_early_death = Some(now);
        }

        if self.early_deaths >= self.limit {
            return Err(self.early_deaths);
        }
        Ok(())
    }

    pub fn early_deaths(&self) -> u32 {
        self.early_deaths
    }
}

/// Why a worker process terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Exited(i32),
    Signaled(Signal),
    /// SIGKILL we did not send; usually the OOM killer
    LikelyOutOfMemory,
    StillAlive,
    Unknown,
}

impl TerminationReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::LikelyOutOfMemory => "killed by SIGKILL (likely out of memory)".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) => TerminationReason::LikelyOutOfMemory,
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_crash_loop_guard() {
        let mut guard = CrashLoopGuard::default();
        let start = Instant::now();

        for _ in 0..4 {
            assert!(guard.record_exit(start, start + Duration::from_secs(1)).is_ok());
        }
        assert_eq!(guard.record_exit(start, start + Duration::from_secs(2)), Err(5));
    }

    #[test]
    fn test_crash_loop_guard_ignores_late_deaths() {
        let mut guard = CrashLoopGuard::default();
        let start = Instant::now();

        for _ in 0..10 {
            assert!(guard.record_exit(start, start + Duration::from_secs(31)).is_ok());
        }
        assert_eq!(guard.early_deaths(), 0);
    }

    #[test]
    fn test_crash_loop_guard_resets() {
        let mut guard = CrashLoopGuard::default();
        let start = Instant::now();

        for _ in 0..4 {
            guard.record_exit(start, start + Duration::from_secs(1)).unwrap();
        }

        let later = start + Duration::from_secs(200);
        assert!(guard.record_exit(later, later + Duration::from_secs(1)).is_ok());
        assert_eq!(guard.early_deaths(), 1);
    }

    #[test]
    fn test_analyze_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            analyze_wait_status(WaitStatus::Exited(pid, 0)),
            TerminationReason::Exited(0)
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false)),
            TerminationReason::LikelyOutOfMemory
        );
        assert_eq!(
            analyze_wait_status(WaitStatus::Signaled(pid, Signal::SIGSEGV, true)),
            TerminationReason::Signaled(Signal::SIGSEGV)
        );
        assert!(TerminationReason::Exited(0).is_success());
    }

    #[test]
    fn test_kill_and_reap() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let process = WorkerProcess::new(Pid::from_raw(child.id() as i32));

        assert_eq!(process.try_wait().unwrap(), None);
        let status = process.kill_and_reap().unwrap();
        assert_eq!(analyze_wait_status(status), TerminationReason::LikelyOutOfMemory);
    }
}
