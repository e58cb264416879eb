use super::super::{
    io::Io,
    job::{Job, JobFlags, JobState},
    process::Process,
    reaper::Timeout,
    send_signal,
    status::ProcStatus,
    terminal, Shell,
};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::signal::{self, Signal},
    unistd::Pid,
};
use smallvec::SmallVec;
use std::{sync::atomic::Ordering, time::Duration};

/// How long a foreground wait sleeps between looks at buffers and in-process stages.
const POLL_INTERVAL_MS: i32 = 10;

/// The longest a foreground wait blocks on the reaper before looking for an exit request.
const EXIT_CHECK_MS: u64 = 100;

/// The outcome of waiting for output on a job's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Timeout,
    NoBuffers,
}

/// Waits briefly for any of the job's buffers to become readable.
pub(crate) fn select_try(job: &Job) -> Readiness {
    let mut fds: SmallVec<[PollFd; 4]> = job
        .all_io()
        .filter_map(|io| match io {
            Io::Buffer(buffer) => Some(PollFd::new(buffer.read_fd(), PollFlags::POLLIN)),
            _ => None,
        })
        .collect();

    if fds.is_empty() {
        return Readiness::NoBuffers;
    }

    match poll(&mut fds, POLL_INTERVAL_MS) {
        Ok(0) | Err(Errno::EINTR) => Readiness::Timeout,
        Ok(_) => Readiness::Ready,
        Err(why) => {
            log::debug!("polling buffers of job {} failed: {}", job.id(), why);
            Readiness::Timeout
        }
    }
}

/// Pulls whatever the job's buffers have available into memory.
fn read_try(job: &mut Job) {
    for buffer in job.block_io_mut().buffers_mut() {
        buffer.read_available();
    }
    for process in &mut job.processes {
        for buffer in process.io.buffers_mut() {
            buffer.read_available();
        }
    }
}

/// Records a status from the OS against `process`. A completed process stays completed.
fn mark_process_status(process: &mut Process, status: ProcStatus) {
    if process.completed {
        return;
    }

    if status.stopped() {
        process.stopped = true;
        process.status = status;
    } else if status.exited() || status.signaled() {
        process.complete_with(status);
    } else if status.continued() {
        process.stopped = false;
    } else {
        // Should never be reached, but a process that cannot be accounted for must not be
        // waited on again.
        eprintln!("jobsh: Process {} exited abnormally", process.pid().map_or(0, Pid::as_raw));
        process.complete_with(status);
    }
}

impl<'a> Shell<'a> {
    /// Continues the job with `id`, resuming it from a stop if `resume` is set. A foreground
    /// job is waited on until it stops, finishes, or the shell is asked to exit; a background
    /// job is left running. Returns where the job ended up, or `None` if there is no such job.
    pub fn continue_job(&mut self, id: u32, resume: bool) -> Option<JobState> {
        let id = self.job(id)?.id();
        self.promote(id);

        let job = self.job_mut(id)?;
        job.set_flag(JobFlags::NOTIFIED, false);
        let foreground = job.get_flag(JobFlags::FOREGROUND);
        let wants_terminal =
            foreground && job.get_flag(JobFlags::TERMINAL) && job.pgid().is_some();

        if !job.is_completed() {
            let index = self.job_index(id)?;
            if wants_terminal {
                // Programs given the terminal expect blocking reads.
                if let Err(why) = sys::set_nonblocking(sys::STDIN_FILENO, false) {
                    log::debug!("could not make stdin blocking: {}", why);
                }
            }
            if wants_terminal && !terminal::give_to_job(&*self.terminal, &self.jobs[index], resume) {
                return Some(self.jobs[index].state());
            }

            let mut resumed = true;
            if resume {
                let job = self.job_mut(id)?;
                for process in job.processes.iter_mut() {
                    process.stopped = false;
                }
                if !send_signal(job, Signal::SIGCONT) {
                    log::warn!("could not resume job {} ('{}')", job.id(), job.command());
                    resumed = false;
                }
            }

            if foreground && resumed {
                self.wait_foreground(id);
            }
        }

        if foreground {
            self.finish_foreground(id, wants_terminal);
        }

        self.job(id).map(Job::state)
    }

    fn wait_foreground(&mut self, id: u32) {
        self.sanity_check();
        self.process_mark_finished_children(false);

        loop {
            let readiness = match self.job(id) {
                Some(job) if !job.is_stopped() && !job.is_completed() => select_try(job),
                _ => break,
            };

            if self.exit_requested() {
                break;
            }

            match readiness {
                Readiness::Ready => {
                    if let Some(job) = self.job_mut(id) {
                        read_try(job);
                    }
                    self.process_mark_finished_children(false);
                }
                Readiness::Timeout => self.process_mark_finished_children(false),
                Readiness::NoBuffers => self.process_mark_finished_children(true),
            }
        }
    }

    /// Settles the shell's state once a foreground job has stopped or finished.
    fn finish_foreground(&mut self, id: u32, wants_terminal: bool) {
        let job = match self.job_mut(id) {
            Some(job) => job,
            None => return,
        };

        if job.is_completed() {
            read_try(job);
            if let Some(last) = job.processes().last() {
                let mut status = last.status().as_status();
                if job.get_flag(JobFlags::NEGATE) {
                    status.toggle();
                }
                self.set_previous_status(status);
            }
        }

        if wants_terminal {
            if let Some(index) = self.job_index(id) {
                terminal::return_to_shell(&*self.terminal, &mut self.jobs[index]);
            }
        }
    }

    /// Collects every status that has arrived for processes of known jobs, and records it.
    /// With `block` set, waits until at least one arrives or an interval passes: a short one
    /// while in-process stages are running, otherwise one short enough to notice an exit
    /// request in time.
    pub(crate) fn process_mark_finished_children(&mut self, block: bool) {
        self.mark_internal_exits();

        let wanted: SmallVec<[Pid; 16]> = self.jobs.iter().flat_map(Job::pending_pids).collect();
        let internal = self.jobs.iter().any(Job::has_pending_internal);
        if wanted.is_empty() && !(block && internal) {
            return;
        }

        let mut timeout = match (block, internal) {
            (false, _) => Timeout::Poll,
            (true, false) => Timeout::After(Duration::from_millis(EXIT_CHECK_MS)),
            (true, true) => Timeout::After(Duration::from_millis(POLL_INTERVAL_MS as u64)),
        };

        while let Some((pid, status)) = self.reaper.acquire(|pid| wanted.contains(&pid), timeout) {
            self.handle_child_status(pid, status);
            timeout = Timeout::Poll;
        }

        self.mark_internal_exits();
    }

    fn mark_internal_exits(&mut self) {
        for process in self.jobs.iter_mut().flat_map(|job| job.processes.iter_mut()) {
            if process.completed {
                continue;
            }
            let status = process.internal().filter(|proc| proc.exited()).map(|proc| proc.status());
            if let Some(status) = status {
                process.complete_with(status);
            }
        }
    }

    /// Applies a status reported by the OS to the process it belongs to. A stage that finished
    /// sends SIGPIPE to the stage feeding it, if that one is still running, so that it does not
    /// write into a pipe nobody reads. A foreground process killed by an interrupt cancels
    /// whatever the interactive shell was running; a non-interactive shell dies of it too.
    pub(crate) fn handle_child_status(&mut self, pid: Pid, status: ProcStatus) {
        let mut foreground = false;
        let mut found = false;

        for job in self.jobs.iter_mut() {
            let index = match job.processes.iter().position(|p| p.pid() == Some(pid)) {
                Some(index) => index,
                None => continue,
            };

            mark_process_status(&mut job.processes[index], status);
            if job.processes[index].completed && index > 0 {
                let upstream = &job.processes[index - 1];
                if let Some(upstream_pid) = upstream.pid().filter(|_| !upstream.completed) {
                    let _ = signal::kill(upstream_pid, Signal::SIGPIPE);
                }
            }

            foreground = job.get_flag(JobFlags::FOREGROUND);
            found = true;
            break;
        }

        if !found {
            log::debug!("status {:?} for unknown child {}", status, pid);
            return;
        }

        match status.signal() {
            Some(sig @ Signal::SIGINT) | Some(sig @ Signal::SIGQUIT) => {
                if !self.opts.interactive {
                    sys::signals::reraise(sig);
                } else if foreground {
                    self.cancelled.store(true, Ordering::SeqCst);
                }
            }
            _ => (),
        }
    }
}
