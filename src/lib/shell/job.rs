use super::{
    io::{Io, IoChain},
    process::Process,
    status::{ProcStatus, Status},
};
use itertools::Itertools;
use nix::{sys::termios::Termios, unistd::Pid};
use std::{
    fmt,
    os::unix::io::RawFd,
    sync::{Arc, Mutex, PoisonError},
};

bitflags! {
    /// Control flags carried by every job.
    #[derive(Default)]
    pub struct JobFlags: u8 {
        /// The user has been told about the job's latest stop or termination.
        const NOTIFIED          = 0b0000_0001;
        const FOREGROUND        = 0b0000_0010;
        /// Every stage has been spawned.
        const CONSTRUCTED       = 0b0000_0100;
        /// Reaped even outside of the interactive top level, silently.
        const SKIP_NOTIFICATION = 0b0000_1000;
        const NEGATE            = 0b0001_0000;
        /// The job runs in a process group of its own.
        const CONTROL           = 0b0010_0000;
        /// The job takes the terminal while in the foreground.
        const TERMINAL          = 0b0100_0000;
    }
}

/// Where a job stands with respect to the continuation state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Launched,
    RunningForeground,
    RunningBackground,
    Stopped,
    Completed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Launched => "launched",
            JobState::RunningForeground | JobState::RunningBackground => "running",
            JobState::Stopped => "stopped",
            JobState::Completed => "completed",
        })
    }
}

/// Hands out the smallest job id not currently held. Slot `n` of the table records whether
/// id `n + 1` is in use.
#[derive(Clone, Debug, Default)]
pub struct JobIdPool(Arc<Mutex<Vec<bool>>>);

impl JobIdPool {
    pub fn new() -> Self { JobIdPool::default() }

    pub fn acquire(&self) -> JobId {
        let mut consumed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = match consumed.iter().position(|&used| !used) {
            Some(slot) => {
                consumed[slot] = true;
                slot
            }
            None => {
                consumed.push(true);
                consumed.len() - 1
            }
        };

        JobId { id: slot as u32 + 1, pool: self.clone() }
    }

    fn release(&self, id: u32) {
        let mut consumed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = id as usize - 1;
        debug_assert!(consumed.get(slot).copied().unwrap_or(false), "job id {} released twice", id);
        if let Some(used) = consumed.get_mut(slot) {
            *used = false;
        }

        while consumed.last() == Some(&false) {
            consumed.pop();
        }
    }

    /// The number of ids currently held.
    pub fn in_use(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|&&used| used).count()
    }
}

/// A held job id. The id returns to its pool when this is dropped.
#[derive(Debug)]
pub struct JobId {
    id:   u32,
    pool: JobIdPool,
}

impl JobId {
    pub fn get(&self) -> u32 { self.id }
}

impl Drop for JobId {
    fn drop(&mut self) { self.pool.release(self.id); }
}

/// A pipeline of processes tracked as a unit.
pub struct Job {
    id:                   JobId,
    command:              String,
    pub(crate) pgid:      Option<Pid>,
    pub(crate) tmodes:    Option<Termios>,
    pub(crate) flags:     JobFlags,
    pub(crate) processes: Vec<Process>,
    block_io:             IoChain,
}

impl Job {
    pub(crate) fn new(id: JobId, command: String, block_io: IoChain, flags: JobFlags) -> Self {
        Job { id, command, pgid: None, tmodes: None, flags, processes: Vec::new(), block_io }
    }

    pub fn id(&self) -> u32 { self.id.get() }

    pub fn command(&self) -> &str { &self.command }

    pub fn pgid(&self) -> Option<Pid> { self.pgid }

    pub fn tmodes(&self) -> Option<&Termios> { self.tmodes.as_ref() }

    pub fn flags(&self) -> JobFlags { self.flags }

    pub fn get_flag(&self, flag: JobFlags) -> bool { self.flags.contains(flag) }

    pub fn set_flag(&mut self, flag: JobFlags, value: bool) { self.flags.set(flag, value) }

    pub fn processes(&self) -> &[Process] { &self.processes }

    pub fn block_io(&self) -> &IoChain { &self.block_io }

    pub(crate) fn block_io_mut(&mut self) -> &mut IoChain { &mut self.block_io }

    pub fn push_process(&mut self, process: Process) { self.processes.push(process); }

    /// Every process is either completed or stopped.
    pub fn is_stopped(&self) -> bool { self.processes.iter().all(|p| p.completed || p.stopped) }

    pub fn is_completed(&self) -> bool { self.processes.iter().all(|p| p.completed) }

    pub fn state(&self) -> JobState {
        if !self.get_flag(JobFlags::CONSTRUCTED) {
            JobState::Launched
        } else if self.is_completed() {
            JobState::Completed
        } else if self.is_stopped() {
            JobState::Stopped
        } else if self.get_flag(JobFlags::FOREGROUND) {
            JobState::RunningForeground
        } else {
            JobState::RunningBackground
        }
    }

    /// Marks the stage at `index`, and every stage after it, as completed. Used when a stage
    /// could not be launched, so that nothing waits on statuses that will never arrive.
    pub fn mark_failed(&mut self, index: usize) { self.mark_failed_with(index, Status::EXEC_FAIL) }

    /// As `mark_failed`, recording `status` for the stages instead.
    pub fn mark_failed_with(&mut self, index: usize, status: Status) {
        let status = ProcStatus::from_exit_code(status.as_os_code());
        for process in self.processes.iter_mut().skip(index) {
            process.complete_with(status);
        }
    }

    /// Pids of stages still waiting on an OS status.
    pub fn pending_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.processes.iter().filter_map(Process::awaits_status)
    }

    /// True while a stage running in-process has not finished.
    pub fn has_pending_internal(&self) -> bool {
        self.processes.iter().any(|p| !p.completed && p.internal().is_some())
    }

    /// The job's block redirections followed by each stage's own, in order.
    pub fn all_io(&self) -> impl Iterator<Item = &Io> {
        self.block_io.iter().chain(self.processes.iter().flat_map(|p| p.io.iter()))
    }

    /// The redirection in effect for `fd` in the stage at `index`, with the block chain
    /// logically prepended to the stage's chain.
    pub fn resolve_io(&self, index: usize, fd: RawFd) -> Option<&Io> {
        let own = self.processes.get(index).and_then(|p| p.io.get_io_for_fd(fd));
        own.or_else(|| self.block_io.get_io_for_fd(fd))
    }

    /// CPU usage of the whole job since the last sample, as a percentage of one CPU.
    pub fn cpu_use(&self) -> u32 {
        let share: f64 = self.processes.iter().map(Process::cpu_use).sum();
        (share * 100.0).round() as u32
    }

    /// The command as shown in notifications: at most 32 characters, with an ellipsis when cut.
    pub fn truncated_command(&self) -> String { truncate_command(&self.command) }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("command", &self.command)
            .field("pgid", &self.pgid)
            .field("flags", &self.flags)
            .field("processes", &self.processes)
            .finish()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = self.pgid.map_or(0, Pid::as_raw);
        write!(f, "{}\t{}\t{}\t{}", self.id(), group, self.state(), self.command)
    }
}

const MAX_COMMAND_DISPLAY: usize = 32;

pub fn truncate_command(command: &str) -> String {
    if command.chars().count() <= MAX_COMMAND_DISPLAY {
        return command.to_owned();
    }

    let mut truncated: String = command.chars().take(MAX_COMMAND_DISPLAY - 1).collect();
    truncated.push('\u{2026}');
    truncated
}

/// Renders the argument vectors of a pipeline as a single command line.
pub fn command_line(processes: &[Process]) -> String {
    processes.iter().map(|p| p.argv().join(" ")).join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(pool: &JobIdPool, stages: usize) -> Job {
        let mut job =
            Job::new(pool.acquire(), "cat | cat | cat".into(), IoChain::new(), JobFlags::empty());
        for _ in 0..stages {
            job.push_process(Process::external(vec!["cat".into()]));
        }
        job
    }

    #[test]
    fn ids_are_unique_while_held() {
        let pool = JobIdPool::new();
        let first = pool.acquire();
        let second = pool.acquire();
        let third = pool.acquire();
        assert_eq!((first.get(), second.get(), third.get()), (1, 2, 3));

        drop(second);
        assert_eq!(pool.in_use(), 2);
        let reused = pool.acquire();
        assert_eq!(reused.get(), 2);
        assert_ne!(reused.get(), first.get());
        assert_ne!(reused.get(), third.get());
    }

    #[test]
    fn releasing_trailing_ids_shrinks_pool() {
        let pool = JobIdPool::new();
        let first = pool.acquire();
        let second = pool.acquire();
        drop(second);
        drop(first);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.acquire().get(), 1);
    }

    #[test]
    fn flags() {
        let mut flags = JobFlags::FOREGROUND | JobFlags::CONTROL;
        assert!(flags.contains(JobFlags::FOREGROUND));
        flags.set(JobFlags::FOREGROUND, false);
        assert!(!flags.contains(JobFlags::FOREGROUND));
        assert!(flags.contains(JobFlags::CONTROL));
        flags |= JobFlags::NOTIFIED;
        assert!(flags.contains(JobFlags::NOTIFIED | JobFlags::CONTROL));
    }

    #[test]
    fn failed_stage_completes_rest_of_pipeline() {
        let pool = JobIdPool::new();
        let mut job = job(&pool, 3);
        job.processes[0].set_pid(Pid::from_raw(100));
        job.mark_failed(1);
        assert!(!job.processes[0].is_completed());
        assert!(job.processes[1].is_completed() && job.processes[2].is_completed());
        assert_eq!(job.processes[2].status().as_status(), Status::EXEC_FAIL);
        assert!(!job.is_completed());
        assert_eq!(job.pending_pids().collect::<Vec<_>>(), vec![Pid::from_raw(100)]);

        job.mark_failed(0);
        assert!(job.is_completed());
        assert_eq!(job.pending_pids().count(), 0);
    }

    #[test]
    fn states() {
        let pool = JobIdPool::new();
        let mut job = job(&pool, 2);
        assert_eq!(job.state(), JobState::Launched);
        job.set_flag(JobFlags::CONSTRUCTED, true);
        assert_eq!(job.state(), JobState::RunningBackground);
        job.set_flag(JobFlags::FOREGROUND, true);
        assert_eq!(job.state(), JobState::RunningForeground);
        job.processes[0].complete_with(ProcStatus::from_exit_code(0));
        job.processes[1].stopped = true;
        assert_eq!(job.state(), JobState::Stopped);
        job.processes[1].complete_with(ProcStatus::from_exit_code(0));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn block_io_is_prepended() {
        let pool = JobIdPool::new();
        let mut block_io = IoChain::new();
        block_io.push(Io::Close(2));
        block_io.push(Io::Close(1));
        let mut job = Job::new(pool.acquire(), "ls".into(), block_io, JobFlags::empty());
        let mut io = IoChain::new();
        io.push(Io::duplicate(1, 2));
        job.push_process(Process::external(vec!["ls".into()]).with_io(io));

        assert!(matches!(job.resolve_io(0, 1), Some(Io::Fd(_))));
        assert!(matches!(job.resolve_io(0, 2), Some(Io::Close(2))));
        assert!(job.resolve_io(0, 0).is_none());
        assert_eq!(job.all_io().map(Io::fd).collect::<Vec<_>>(), vec![2, 1, 1]);
    }

    #[test]
    fn command_truncation() {
        assert_eq!(truncate_command("sleep 10"), "sleep 10");
        let long = "find / -name '*.rs' -exec grep -l unsafe {} +";
        let truncated = truncate_command(long);
        assert_eq!(truncated.chars().count(), 32);
        assert!(truncated.ends_with('\u{2026}'));
        assert!(long.starts_with(truncated.trim_end_matches('\u{2026}')));
    }
}
