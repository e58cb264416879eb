use super::status::Status;
use nix::unistd::Pid;
use std::fmt;

/// Lifecycle notifications fired by the reap pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// A process finished. `status` is its exit code, or -1 if a signal killed it.
    ProcessExit { pid: Pid, status: i32 },
    /// Every process of a job finished. `pgid` is the negated process group of the job.
    JobExit { pgid: i32, job_id: u32 },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Event::ProcessExit { pid, status } => write!(f, "PROCESS_EXIT {} {}", pid, status),
            Event::JobExit { pgid, job_id } => write!(f, "JOB_EXIT {} {}", pgid, job_id),
        }
    }
}

/// A handler may run arbitrary commands, and so may alter the shell's last status; any such
/// change is discarded once the reap pass that fired the event is over.
pub type EventHandler<'a> = Box<dyn FnMut(&Event, &mut Status) + 'a>;
