//! This module contains all of the code that runs in, or talks to, signal handlers.
//!
//! Handlers never do real work: they bump atomics that ordinary threads look at later. SIGCHLD
//! advances a generation counter that prompts reaping, and SIGINT/SIGHUP/SIGTERM set bits in
//! `PENDING`.

use nix::{
    libc::{self, c_int},
    sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub(crate) use sys::signals::{block, unblock};

pub static PENDING: AtomicU8 = AtomicU8::new(0);
pub const SIGINT: u8 = 1;
pub const SIGHUP: u8 = 2;
pub const SIGTERM: u8 = 4;

static SIGCHLD_GENERATION: AtomicU32 = AtomicU32::new(0);

extern "C" fn child_handler(_: c_int) { SIGCHLD_GENERATION.fetch_add(1, Ordering::Release); }

extern "C" fn handler(signal: c_int) {
    let bit = match signal {
        libc::SIGINT => SIGINT,
        libc::SIGHUP => SIGHUP,
        libc::SIGTERM => SIGTERM,
        _ => return,
    };
    PENDING.fetch_or(bit, Ordering::SeqCst);
}

fn install(signal: Signal, handler: extern "C" fn(c_int), flags: SaFlags) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(handler), flags, SigSet::empty());
    unsafe { sigaction(signal, &action) }.map(|_| ())
}

/// Counts SIGCHLD deliveries so that reaping can be skipped when nothing has changed.
pub fn install_child_handler() -> nix::Result<()> {
    install(Signal::SIGCHLD, child_handler, SaFlags::SA_RESTART)
}

/// Routes SIGHUP and SIGTERM, and SIGINT for an interactive shell, into `PENDING`. The exit
/// requests do not restart system calls, so that a blocking wait notices them.
pub fn install_handlers(interactive: bool) -> nix::Result<()> {
    install_child_handler()?;
    install(Signal::SIGHUP, handler, SaFlags::empty())?;
    install(Signal::SIGTERM, handler, SaFlags::empty())?;
    if interactive {
        install(Signal::SIGINT, handler, SaFlags::SA_RESTART)?;
    }
    Ok(())
}

/// The number of SIGCHLD signals observed so far, wrapping.
pub fn sigchld_generation() -> u32 { SIGCHLD_GENERATION.load(Ordering::Acquire) }

/// A hangup or termination request has arrived and the shell should wind down.
pub fn exit_requested() -> bool { PENDING.load(Ordering::SeqCst) & (SIGHUP | SIGTERM) != 0 }

/// Takes the pending signal bits, clearing them.
pub fn take_pending() -> u8 { PENDING.swap(0, Ordering::SeqCst) }

/// The purpose of the signal handler is to ignore signals when it is active, and then continue
/// listening to signals once the handler is dropped.
pub(crate) struct SignalHandler;

impl SignalHandler {
    pub(crate) fn new() -> SignalHandler {
        block();
        SignalHandler
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) { unblock(); }
}

/// A human readable description of what a signal means to the user.
pub fn describe(signal: Signal) -> &'static str {
    match signal {
        Signal::SIGHUP => "Terminal hung up",
        Signal::SIGINT => "Quit request from job control (^C)",
        Signal::SIGQUIT => "Quit request from job control with core dump (^\\)",
        Signal::SIGILL => "Illegal instruction",
        Signal::SIGTRAP => "Trace or breakpoint trap",
        Signal::SIGABRT => "Abort",
        Signal::SIGBUS => "Misaligned address error",
        Signal::SIGFPE => "Floating point exception",
        Signal::SIGKILL => "Forced quit",
        Signal::SIGUSR1 => "User defined signal 1",
        Signal::SIGUSR2 => "User defined signal 2",
        Signal::SIGSEGV => "Address boundary error",
        Signal::SIGPIPE => "Broken pipe",
        Signal::SIGALRM => "Timer expired",
        Signal::SIGTERM => "Polite quit request",
        Signal::SIGCHLD => "Child process status changed",
        Signal::SIGCONT => "Continue previously stopped process",
        Signal::SIGSTOP => "Forced stop",
        Signal::SIGTSTP => "Stop request from job control (^Z)",
        Signal::SIGTTIN => "Stop from terminal input",
        Signal::SIGTTOU => "Stop from terminal output",
        Signal::SIGURG => "Urgent socket condition",
        Signal::SIGXCPU => "CPU time limit exceeded",
        Signal::SIGXFSZ => "File size limit exceeded",
        Signal::SIGVTALRM => "Virtual timer expired",
        Signal::SIGPROF => "Profiling timer expired",
        Signal::SIGWINCH => "Window size change",
        Signal::SIGIO => "I/O on asynchronous file descriptor is possible",
        Signal::SIGSYS => "Bad system call",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions() {
        assert_eq!(describe(Signal::SIGINT), "Quit request from job control (^C)");
        assert_eq!(describe(Signal::SIGPIPE), "Broken pipe");
        assert_eq!(Signal::SIGTERM.as_str(), "SIGTERM");
    }

    #[test]
    fn handler_only_sets_bits() {
        handler(libc::SIGWINCH);
        assert_eq!(PENDING.load(Ordering::SeqCst) & !(SIGINT | SIGHUP | SIGTERM), 0);
        let before = sigchld_generation();
        child_handler(libc::SIGCHLD);
        assert_eq!(sigchld_generation(), before.wrapping_add(1));
    }
}
