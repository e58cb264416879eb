//! Hands the controlling terminal to a job's process group and takes it back.

use super::{job::Job, signals::SignalHandler};
use nix::{
    sys::termios::{self, SetArg, Termios},
    unistd::{self, Pid},
};
use std::os::unix::io::RawFd;

/// The operations the shell needs from its controlling terminal.
pub trait Terminal {
    /// The descriptor a forked child may use to claim the terminal for its own group, if the
    /// terminal is a real one.
    fn fd(&self) -> Option<RawFd>;

    /// The process group the terminal should belong to while the shell is in charge.
    fn shell_group(&self) -> Pid;

    fn set_foreground_group(&self, pgid: Pid) -> nix::Result<()>;

    fn modes(&self) -> nix::Result<Termios>;

    fn set_modes(&self, modes: &Termios) -> nix::Result<()>;
}

/// The terminal attached to a descriptor, normally standard input.
#[derive(Debug, Clone, Copy)]
pub struct Tty {
    fd: RawFd,
}

impl Tty {
    pub fn new(fd: RawFd) -> Self { Tty { fd } }

    pub fn stdin() -> Self { Tty::new(sys::STDIN_FILENO) }
}

impl Terminal for Tty {
    fn fd(&self) -> Option<RawFd> { Some(self.fd) }

    fn shell_group(&self) -> Pid { unistd::getpgrp() }

    fn set_foreground_group(&self, pgid: Pid) -> nix::Result<()> {
        loop {
            match unistd::tcsetpgrp(self.fd, pgid) {
                Err(nix::errno::Errno::EINTR) => continue,
                result => return result,
            }
        }
    }

    fn modes(&self) -> nix::Result<Termios> { termios::tcgetattr(self.fd) }

    fn set_modes(&self, modes: &Termios) -> nix::Result<()> {
        termios::tcsetattr(self.fd, SetArg::TCSADRAIN, modes)
    }
}

/// Gives the terminal to `job`. When the job is being resumed and left modes behind on its
/// last stop, those are restored as well. Returns false, having logged why, if the terminal
/// could not be handed over, in which case the job should not be continued.
pub fn give_to_job(terminal: &dyn Terminal, job: &Job, resume: bool) -> bool {
    let pgid = match job.pgid() {
        Some(pgid) => pgid,
        None => {
            log::warn!("job {} has no process group to give the terminal to", job.id());
            return false;
        }
    };

    let _guard = SignalHandler::new();
    if let Err(why) = terminal.set_foreground_group(pgid) {
        log::warn!("could not send job {} ('{}') to foreground: {}", job.id(), job.command(), why);
        return false;
    }

    if resume {
        if let Some(modes) = job.tmodes() {
            if let Err(why) = terminal.set_modes(modes) {
                log::warn!("could not restore terminal modes for job {}: {}", job.id(), why);
                return false;
            }
        }
    }

    true
}

/// Takes the terminal back from `job` and records the modes it leaves behind. The capture
/// happens on every return, whether the job stopped or finished.
pub fn return_to_shell(terminal: &dyn Terminal, job: &mut Job) -> bool {
    let _guard = SignalHandler::new();
    if let Err(why) = terminal.set_foreground_group(terminal.shell_group()) {
        log::warn!("could not return shell to foreground: {}", why);
        return false;
    }

    match terminal.modes() {
        Ok(modes) => {
            job.tmodes = Some(modes);
            true
        }
        Err(why) => {
            log::warn!("could not save terminal modes for job {}: {}", job.id(), why);
            false
        }
    }
}
