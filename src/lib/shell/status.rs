use nix::sys::signal::Signal;
use std::{convert::TryFrom, fmt};

/// The exit status of a command, as the shell reports it to scripts and to the user.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Status(i32);

impl Status {
    pub const EXEC_FAIL: Self = Status(125);
    pub const FAILURE: Self = Status(1);
    pub const NOT_EXECUTABLE: Self = Status(126);
    pub const SUCCESS: Self = Status(0);
    pub const TERMINATED: Self = Status(143);
    pub const UNKNOWN_COMMAND: Self = Status(127);

    pub fn from_signal(signal: i32) -> Self { Status(128 + signal) }

    pub fn from_exit_code(code: i32) -> Self { Status(code) }

    pub fn error<T: AsRef<str>>(err: T) -> Self {
        let err = err.as_ref();
        if !err.is_empty() {
            eprintln!("{}", err);
        }
        Status::FAILURE
    }

    pub fn bad_argument<T: AsRef<str>>(err: T) -> Self {
        let err = err.as_ref();
        if !err.is_empty() {
            eprintln!("{}", err);
        }
        Status(2)
    }

    pub fn is_success(self) -> bool { self.0 == 0 }

    pub fn as_os_code(self) -> i32 { self.0 }

    /// Negation as applied by `!`: success becomes 1, any failure becomes 0.
    pub fn toggle(&mut self) { self.0 = if self.is_success() { 1 } else { 0 }; }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

/// A raw wait status, exactly as `waitpid` reported it, or synthesized for stages that never
/// had an OS process of their own.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct ProcStatus(i32);

impl ProcStatus {
    pub fn from_raw(status: i32) -> Self { ProcStatus(status) }

    pub fn from_exit_code(code: i32) -> Self { ProcStatus(sys::w_exitcode(code, 0)) }

    pub fn from_signal(signal: Signal) -> Self { ProcStatus(sys::w_exitcode(0, signal as i32)) }

    pub fn from_stop(signal: Signal) -> Self { ProcStatus(sys::w_stopcode(signal as i32)) }

    pub fn raw(self) -> i32 { self.0 }

    pub fn exited(self) -> bool { sys::wifexited(self.0) }

    pub fn signaled(self) -> bool { sys::wifsignaled(self.0) }

    pub fn stopped(self) -> bool { sys::wifstopped(self.0) }

    pub fn continued(self) -> bool { sys::wifcontinued(self.0) }

    pub fn exit_code(self) -> i32 { sys::wexitstatus(self.0) }

    pub fn signal(self) -> Option<Signal> {
        if self.signaled() {
            Signal::try_from(sys::wtermsig(self.0)).ok()
        } else {
            None
        }
    }

    pub fn stop_signal(self) -> Option<Signal> {
        if self.stopped() {
            Signal::try_from(sys::wstopsig(self.0)).ok()
        } else {
            None
        }
    }

    /// The status a script observes: `128 + signal` for a killed process, else the exit code.
    pub fn as_status(self) -> Status {
        if self.signaled() {
            Status::from_signal(sys::wtermsig(self.0))
        } else {
            Status::from_exit_code(self.exit_code())
        }
    }

    /// The numeric argument handed to process-exit event handlers: -1 for a killed process.
    pub fn event_code(self) -> i32 { if self.signaled() { -1 } else { self.exit_code() } }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle() {
        let mut status = Status::SUCCESS;
        status.toggle();
        assert_eq!(status, Status::FAILURE);
        let mut status = Status::UNKNOWN_COMMAND;
        status.toggle();
        assert_eq!(status, Status::SUCCESS);
    }

    #[test]
    fn killed_process() {
        let status = ProcStatus::from_signal(Signal::SIGTERM);
        assert!(status.signaled());
        assert_eq!(status.signal(), Some(Signal::SIGTERM));
        assert_eq!(status.as_status(), Status::TERMINATED);
        assert_eq!(status.event_code(), -1);
    }

    #[test]
    fn exited_process() {
        let status = ProcStatus::from_exit_code(3);
        assert!(status.exited());
        assert_eq!(status.signal(), None);
        assert_eq!(status.as_status(), Status::from_exit_code(3));
        assert_eq!(status.event_code(), 3);
    }

    #[test]
    fn stopped_process() {
        let status = ProcStatus::from_stop(Signal::SIGTSTP);
        assert!(status.stopped());
        assert!(!status.exited() && !status.signaled());
        assert_eq!(status.stop_signal(), Some(Signal::SIGTSTP));
    }
}
