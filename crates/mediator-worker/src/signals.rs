//! Async-signal-safe flags for the signals the pool reacts to.
//!
//! Handlers are installed without `SA_RESTART`, so a blocking queue
//! receive returns `EINTR` and the loop gets to look at the flags.

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static TERMINATE: AtomicBool = AtomicBool::new(false);
static INTERRUPT: AtomicBool = AtomicBool::new(false);
static HANGUP: AtomicBool = AtomicBool::new(false);
static DUMP: AtomicBool = AtomicBool::new(false);

fn flag(signal: Signal) -> Option<&'static AtomicBool> {
    match signal {
        Signal::SIGTERM => Some(&TERMINATE),
        Signal::SIGINT => Some(&INTERRUPT),
        Signal::SIGHUP => Some(&HANGUP),
        Signal::SIGUSR1 => Some(&DUMP),
        _ => None,
    }
}

extern "C" fn on_signal(signum: libc::c_int) {
    let target = match signum {
        libc::SIGTERM => &TERMINATE,
        libc::SIGINT => &INTERRUPT,
        libc::SIGHUP => &HANGUP,
        libc::SIGUSR1 => &DUMP,
        _ => return,
    };
    target.store(true, Ordering::SeqCst);
}

/// Install the flag-setting handler for `signals`
pub fn install(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in signals {
        // SAFETY: the handler only stores to atomics.
        unsafe { sigaction(*signal, &action) }?;
    }
    Ok(())
}

/// Restore default dispositions
pub fn restore(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in signals {
        // SAFETY: resetting to the default disposition.
        unsafe { sigaction(*signal, &action) }?;
    }
    Ok(())
}

/// Whether `signal` arrived; clears the flag
pub fn take(signal: Signal) -> bool {
    flag(signal).is_some_and(|f| f.swap(false, Ordering::SeqCst))
}

/// Whether `signal` arrived, leaving the flag set
pub fn pending(signal: Signal) -> bool {
    flag(signal).is_some_and(|f| f.load(Ordering::SeqCst))
}

/// TERM, INT or HUP arrived
pub fn shutdown_requested() -> bool {
    pending(Signal::SIGTERM) || pending(Signal::SIGINT) || pending(Signal::SIGHUP)
}

/// Clear every flag; a freshly forked worker starts clean
pub fn reset() {
    for f in [&TERMINATE, &INTERRUPT, &HANGUP, &DUMP] {
        f.store(false, Ordering::SeqCst);
    }
}

/// Simulate delivery, for tests and in-process shutdown requests
pub fn raise_flag(signal: Signal) {
    if let Some(f) = flag(signal) {
        f.store(true, Ordering::SeqCst);
    }
}
