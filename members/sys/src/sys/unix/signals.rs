use nix::{
    sys::signal::{self, pthread_sigmask, SigHandler, SigSet, SigmaskHow, Signal},
    unistd::Pid,
};

const JOB_CONTROL: [Signal; 4] =
    [Signal::SIGTSTP, Signal::SIGTTOU, Signal::SIGTTIN, Signal::SIGCHLD];

/// Signals whose dispositions an interactive shell changes and a child must get back.
const INHERITED: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTSTP,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
    Signal::SIGCHLD,
    Signal::SIGPIPE,
];

fn job_control_set() -> SigSet {
    let mut set = SigSet::empty();
    JOB_CONTROL.iter().for_each(|&sig| set.add(sig));
    set
}

/// Blocks the SIGTSTP/SIGTTOU/SIGTTIN/SIGCHLD signals on the calling thread, so that the
/// terminal can change hands without the shell being stopped midway.
pub fn block() {
    let _ = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&job_control_set()), None);
}

/// Unblocks the SIGTSTP/SIGTTOU/SIGTTIN/SIGCHLD signals on the calling thread.
pub fn unblock() {
    let _ = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&job_control_set()), None);
}

/// Clears the signal mask entirely. Called in a forked child before exec.
pub fn unblock_all() {
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Restores the default disposition of every signal the shell may have altered. Called in a
/// forked child before exec.
pub fn reset_dispositions() {
    for &sig in &INHERITED {
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}

/// An interactive shell must not be stopped by the terminal it hands around.
pub fn ignore_terminal_stops() {
    for &sig in &[Signal::SIGTSTP, Signal::SIGTTIN, Signal::SIGTTOU] {
        let _ = unsafe { signal::signal(sig, SigHandler::SigIgn) };
    }
}

/// Re-delivers `sig` to this process with its default disposition, terminating it the same way
/// the signal would have terminated a process without job control.
pub fn reraise(sig: Signal) {
    for &other in &[Signal::SIGINT, Signal::SIGQUIT] {
        let _ = unsafe { signal::signal(other, SigHandler::SigDfl) };
    }
    let mut set = SigSet::empty();
    set.add(sig);
    let _ = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
    let _ = signal::kill(Pid::this(), sig);
}
