/// Lifecycle events fired while reaping
pub mod events;
/// Redirections and the chains they form
pub mod io;
mod job;
mod pipe_exec;
mod process;
/// Serialized waiting on child processes
pub mod reaper;
/// Signal handlers and signal masks
pub mod signals;
pub mod status;
/// Controlling terminal hand-off
pub mod terminal;

pub use self::{
    events::{Event, EventHandler},
    job::{command_line, truncate_command, Job, JobFlags, JobId, JobIdPool, JobState},
    pipe_exec::PipelineError,
    process::{BlockBody, BuiltinFunction, InternalProc, Process, ProcessKind},
};
use self::{
    io::IoChain,
    reaper::{ReapStrategy, Reaper},
    status::Status,
    terminal::{Terminal, Tty},
};
use nix::{
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use std::{
    collections::VecDeque,
    fmt,
    io::{self as stdio, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

/// Which jobs get a process group of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobControlMode {
    All,
    /// Only when the session is interactive.
    Interactive,
    None,
}

impl Default for JobControlMode {
    fn default() -> Self { JobControlMode::Interactive }
}

/// Options for the shell
#[derive(Debug, Clone, Default, Hash)]
pub struct Options {
    /// Which jobs are placed under job control.
    pub job_control: JobControlMode,
    /// The shell is reading commands from a user at a terminal.
    pub interactive: bool,
    /// How child statuses are collected.
    pub reap: ReapStrategy,
    /// Hangup on exiting the shell.
    pub huponexit: bool,
}

/// An internal invariant of the job list was broken.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanityError {
    #[error("jobs {0} and {1} are both running in the foreground")]
    MultipleForeground(u32, u32),
    #[error("job {0} has no processes")]
    EmptyJob(u32),
    #[error("process {pid} of job {job} is both completed and stopped")]
    StoppedAfterCompletion { job: u32, pid: i32 },
}

/// The shell structure is a megastructure that owns all job-control state: the job list, the
/// job id pool, the terminal, and the link to the process reaper. It is initialized at the
/// beginning of the program and lives until the end of the program.
pub struct Shell<'a> {
    /// Jobs, most recently promoted first.
    jobs: VecDeque<Job>,
    job_ids: JobIdPool,
    reaper: Arc<Reaper>,
    terminal: Box<dyn Terminal + 'a>,
    /// Contains all the options relative to the shell
    opts: Options,
    /// When a command is executed, the final result of that command is stored
    /// here.
    previous_status: Status,
    handlers: Vec<EventHandler<'a>>,
    /// Set while a reap pass is running.
    reaping: bool,
    /// Raised when an interactive foreground job is interrupted; open blocks should unwind.
    cancelled: Arc<AtomicBool>,
    exit_requested: Arc<AtomicBool>,
    /// Where job status messages are written.
    notifications: Box<dyn Write + 'a>,
}

impl<'a> Default for Shell<'a> {
    fn default() -> Self { Self::new() }
}

impl<'a> Shell<'a> {
    /// Create a new shell with default settings
    pub fn new() -> Self { ShellBuilder::new().build() }

    pub fn builder() -> ShellBuilder<'a> { ShellBuilder::new() }

    /// Access to the shell options
    pub const fn opts(&self) -> &Options { &self.opts }

    /// Mutable access to the shell options
    pub fn opts_mut(&mut self) -> &mut Options { &mut self.opts }

    pub fn reaper(&self) -> &Arc<Reaper> { &self.reaper }

    pub fn terminal(&self) -> &dyn Terminal { &*self.terminal }

    /// Get the last command's return code and/or the code for the error
    pub const fn previous_status(&self) -> Status { self.previous_status }

    pub fn set_previous_status(&mut self, status: Status) { self.previous_status = status; }

    /// Registers a handler for process and job exit events.
    pub fn add_event_handler(&mut self, handler: EventHandler<'a>) { self.handlers.push(handler); }

    /// Starts a new job in the job list and returns its id. The job control flags are derived
    /// from the shell's job control mode.
    pub fn create_job(&mut self, command: &str, block_io: IoChain, foreground: bool) -> u32 {
        let control = match self.opts.job_control {
            JobControlMode::All => true,
            JobControlMode::Interactive => self.opts.interactive,
            JobControlMode::None => false,
        };

        let mut flags = JobFlags::empty();
        flags.set(JobFlags::FOREGROUND, foreground);
        flags.set(JobFlags::CONTROL, control);
        flags.set(JobFlags::TERMINAL, control && self.opts.interactive);

        let job = Job::new(self.job_ids.acquire(), command.to_owned(), block_io, flags);
        let id = job.id();
        self.jobs.push_front(job);
        id
    }

    /// Looks up a job by id. The id 0 names the most recent job.
    pub fn job(&self, id: u32) -> Option<&Job> {
        if id == 0 {
            self.jobs.front()
        } else {
            self.jobs.iter().find(|job| job.id() == id)
        }
    }

    pub fn job_mut(&mut self, id: u32) -> Option<&mut Job> {
        if id == 0 {
            self.jobs.front_mut()
        } else {
            self.jobs.iter_mut().find(|job| job.id() == id)
        }
    }

    pub fn job_from_pgid(&self, pgid: Pid) -> Option<&Job> {
        self.jobs.iter().find(|job| job.pgid() == Some(pgid))
    }

    /// Jobs from the most recently promoted to the oldest.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> { self.jobs.iter() }

    pub fn job_count(&self) -> usize { self.jobs.len() }

    pub fn job_ids(&self) -> &JobIdPool { &self.job_ids }

    /// Moves the job to the front of the job list.
    pub fn promote(&mut self, id: u32) -> bool {
        match self.jobs.iter().position(|job| job.id() == id) {
            Some(position) => {
                if let Some(job) = self.jobs.remove(position) {
                    self.jobs.push_front(job);
                }
                true
            }
            None => false,
        }
    }

    /// Takes the job out of the job list. Its id is released once the job is dropped.
    pub fn remove_job(&mut self, id: u32) -> Option<Job> {
        let position = self.jobs.iter().position(|job| job.id() == id)?;
        self.jobs.remove(position)
    }

    pub(crate) fn job_index(&self, id: u32) -> Option<usize> {
        if id == 0 && !self.jobs.is_empty() {
            Some(0)
        } else {
            self.jobs.iter().position(|job| job.id() == id)
        }
    }

    /// Records that the stage at `index` of job `id` has been forked as `pid`, and lets the
    /// reaper know there is a new child to wait for. The first stage spawned decides the
    /// job's process group.
    pub fn process_spawned(&mut self, id: u32, index: usize, pid: Pid) {
        if let Some(job) = self.job_mut(id) {
            if job.pgid.is_none() {
                job.pgid = Some(if job.get_flag(JobFlags::CONTROL) { pid } else { unistd::getpgrp() });
            }
            if let Some(process) = job.processes.get_mut(index) {
                process.set_pid(pid);
            }
        }
        self.reaper.spawned();
    }

    /// Sends `signal` to every process of the job: to its process group when it has one of
    /// its own, else to each live process individually.
    pub fn signal_job(&self, id: u32, sig: Signal) -> bool {
        match self.job(id) {
            Some(job) => send_signal(job, sig),
            None => false,
        }
    }

    /// Hangs up every job that is still alive, waking stopped ones so they see the signal.
    pub fn hup_jobs(&self) {
        for job in self.jobs.iter().filter(|job| !job.is_completed()) {
            send_signal(job, Signal::SIGHUP);
            if job.is_stopped() {
                send_signal(job, Signal::SIGCONT);
            }
        }
    }

    /// Begins a new CPU usage interval for every process of every job.
    pub fn update_jiffies(&mut self) {
        for process in self.jobs.iter_mut().flat_map(|job| job.processes.iter_mut()) {
            process.update_jiffies();
        }
    }

    pub fn cancel_requested(&self) -> bool { self.cancelled.load(Ordering::SeqCst) }

    pub fn clear_cancel(&self) { self.cancelled.store(false, Ordering::SeqCst); }

    /// Asks foreground waits to stop waiting as soon as possible.
    pub fn request_exit(&self) { self.exit_requested.store(true, Ordering::SeqCst); }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst) || signals::exit_requested()
    }

    /// Returns the first broken invariant of the job list, if any.
    pub fn sanity_violation(&self) -> Option<SanityError> {
        let mut foreground = None;
        for job in &self.jobs {
            if job.get_flag(JobFlags::CONSTRUCTED) && job.processes.is_empty() {
                return Some(SanityError::EmptyJob(job.id()));
            }

            if let Some(process) = job.processes.iter().find(|p| p.completed && p.stopped) {
                return Some(SanityError::StoppedAfterCompletion {
                    job: job.id(),
                    pid: process.pid().map_or(0, Pid::as_raw),
                });
            }

            if job.state() == JobState::RunningForeground {
                match foreground {
                    Some(other) => return Some(SanityError::MultipleForeground(other, job.id())),
                    None => foreground = Some(job.id()),
                }
            }
        }
        None
    }

    /// Aborts the shell if the job list is in a state it should never be in. Carrying on would
    /// risk leaking zombies or leaving the terminal with the wrong process group.
    pub fn sanity_check(&self) {
        if let Some(why) = self.sanity_violation() {
            log::error!("job list is inconsistent: {}", why);
            eprintln!("jobsh: internal error: {}", why);
            std::process::abort();
        }
    }

    pub(crate) fn notify(&mut self, message: fmt::Arguments<'_>) {
        let _ = self.notifications.write_fmt(message);
        let _ = self.notifications.write_all(b"\n");
        let _ = self.notifications.flush();
    }
}

fn send_signal(job: &Job, sig: Signal) -> bool {
    match job.pgid() {
        Some(pgid) if job.get_flag(JobFlags::CONTROL) && pgid != unistd::getpgrp() => {
            signal::killpg(pgid, sig).is_ok()
        }
        _ => job
            .processes()
            .iter()
            .filter(|p| !p.is_completed())
            .filter_map(Process::pid)
            .fold(true, |ok, pid| signal::kill(pid, sig).is_ok() && ok),
    }
}

/// Constructs a `Shell`, overriding whichever parts need to differ from the defaults.
pub struct ShellBuilder<'a> {
    opts:            Options,
    terminal:        Option<Box<dyn Terminal + 'a>>,
    reaper:          Option<Arc<Reaper>>,
    notifications:   Option<Box<dyn Write + 'a>>,
    signal_handlers: bool,
}

impl<'a> Default for ShellBuilder<'a> {
    fn default() -> Self { Self::new() }
}

impl<'a> ShellBuilder<'a> {
    pub fn new() -> Self {
        ShellBuilder {
            opts:            Options::default(),
            terminal:        None,
            reaper:          None,
            notifications:   None,
            signal_handlers: false,
        }
    }

    pub fn options(mut self, opts: Options) -> Self {
        self.opts = opts;
        self
    }

    pub fn job_control(mut self, mode: JobControlMode) -> Self {
        self.opts.job_control = mode;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.opts.interactive = interactive;
        self
    }

    pub fn reap_strategy(mut self, strategy: ReapStrategy) -> Self {
        self.opts.reap = strategy;
        self
    }

    pub fn huponexit(mut self, huponexit: bool) -> Self {
        self.opts.huponexit = huponexit;
        self
    }

    pub fn terminal<T: Terminal + 'a>(mut self, terminal: T) -> Self {
        self.terminal = Some(Box::new(terminal));
        self
    }

    /// Uses a specific reaper rather than the process-wide one.
    pub fn reaper(mut self, reaper: Arc<Reaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    pub fn notifications<W: Write + 'a>(mut self, out: W) -> Self {
        self.notifications = Some(Box::new(out));
        self
    }

    /// Install the shell's signal handlers when building.
    pub fn signal_handlers(mut self, install: bool) -> Self {
        self.signal_handlers = install;
        self
    }

    pub fn build(self) -> Shell<'a> {
        let mut opts = self.opts;
        let reaper = self.reaper.unwrap_or_else(|| Reaper::global(opts.reap));
        opts.reap = reaper.strategy();

        let installed = if self.signal_handlers {
            signals::install_handlers(opts.interactive)
        } else if opts.reap == ReapStrategy::Direct {
            signals::install_child_handler()
        } else {
            Ok(())
        };
        if let Err(why) = installed {
            log::warn!("unable to install signal handlers: {}", why);
        }

        Shell {
            jobs: VecDeque::new(),
            job_ids: JobIdPool::new(),
            reaper,
            terminal: self.terminal.unwrap_or_else(|| Box::new(Tty::stdin())),
            opts,
            previous_status: Status::SUCCESS,
            handlers: Vec::new(),
            reaping: false,
            cancelled: Arc::new(AtomicBool::new(false)),
            exit_requested: Arc::new(AtomicBool::new(false)),
            notifications: self.notifications.unwrap_or_else(|| Box::new(stdio::stdout())),
        }
    }
}
