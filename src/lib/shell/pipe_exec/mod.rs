//! The purpose of the pipeline execution module is to turn a list of stages into a running job,
//! and to follow that job until it stops or finishes. That includes forking, wiring the stages
//! together with pipes, assigning process groups, applying redirections in the children,
//! running builtins and blocks inside the shell, and waiting on the foreground.

mod job_control;
mod reap;
mod streams;

use super::{
    io::{self, Io, IoBuffer, IoChain, RedirectionError},
    job::{Job, JobFlags},
    process::{Process, ProcessKind},
    signals,
    status::{ProcStatus, Status},
    InternalProc, Shell,
};
use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    sys::stat::Mode,
    unistd::{self, ForkResult, Pid},
};
use std::{
    env,
    ffi::CString,
    fs::File,
    io::{self as stdio, Write},
    os::unix::{
        ffi::OsStrExt,
        io::{FromRawFd, RawFd},
    },
    path::PathBuf,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot run an empty pipeline")]
    EmptyPipeline,
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("argument contains a NUL byte: {0:?}")]
    NulArgument(String),
    #[error("failed to fork: {0}")]
    Fork(#[source] Errno),
    #[error("failed to exec {0}: {1}")]
    Exec(String, #[source] Errno),
    #[error("could not start '{0}': {1}")]
    Internal(String, #[source] stdio::Error),
    #[error("could not redirect output of '{0}': {1}")]
    Output(String, #[source] Errno),
    #[error(transparent)]
    Redirection(#[from] RedirectionError),
}

impl PipelineError {
    /// The status a failed launch leaves behind.
    pub fn status(&self) -> Status {
        match self {
            PipelineError::CommandNotFound(_) => Status::UNKNOWN_COMMAND,
            PipelineError::Exec(..) => Status::NOT_EXECUTABLE,
            _ => Status::EXEC_FAIL,
        }
    }
}

/// Finds `program` on `PATH`, unless it already names a path.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }

    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).map(|dir| dir.join(program)).find(|path| path.is_file())
}

/// Everything a forked child needs, computed before the fork so that the child does not have
/// to allocate.
struct ChildPlan {
    path:    CString,
    argv:    Vec<CString>,
    pgid:    Option<Pid>,
    tty:     Option<RawFd>,
    failure: Vec<u8>,
}

impl ChildPlan {
    fn new(job: &Job, process: &Process, tty: Option<RawFd>) -> Result<Self, PipelineError> {
        let program = process.program();
        let path = resolve_program(program)
            .ok_or_else(|| PipelineError::CommandNotFound(program.to_owned()))?;
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| PipelineError::NulArgument(program.to_owned()))?;
        let argv = process
            .argv()
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PipelineError::NulArgument(program.to_owned()))?;

        let pgid = if job.get_flag(JobFlags::CONTROL) {
            Some(job.pgid().unwrap_or_else(|| Pid::from_raw(0)))
        } else {
            None
        };

        Ok(ChildPlan { path, argv, pgid, tty, failure: format!("jobsh: {}: ", program).into_bytes() })
    }

    /// Runs in the forked child. Never returns.
    fn exec(&self, job: &Job, pipes: &IoChain, own: &IoChain) -> ! {
        if let Some(pgid) = self.pgid {
            let _ = unistd::setpgid(Pid::from_raw(0), pgid);
            if let Some(tty) = self.tty {
                signals::block();
                let _ = unistd::tcsetpgrp(tty, unistd::getpgrp());
            }
        }

        sys::signals::reset_dispositions();
        sys::signals::unblock_all();

        for chain in &[job.block_io(), pipes, own] {
            if let Err((_, why)) = streams::apply(chain) {
                sys::write_raw(sys::STDERR_FILENO, &[
                    &self.failure,
                    b"redirection failed: ",
                    why.desc().as_bytes(),
                    b"\n",
                ]);
                sys::fork_exit(1);
            }
        }

        let why = match unistd::execv(&self.path, &self.argv) {
            Err(why) => why,
            Ok(never) => match never {},
        };
        sys::write_raw(sys::STDERR_FILENO, &[&self.failure, why.desc().as_bytes(), b"\n"]);
        sys::fork_exit(if why == Errno::ENOENT {
            Status::UNKNOWN_COMMAND.as_os_code()
        } else {
            Status::NOT_EXECUTABLE.as_os_code()
        })
    }
}

/// Opens a writable handle on wherever `io` sends its output. `None` means the output is not
/// redirected, or is redirected to a closed descriptor, and is handled by the caller.
fn output_for(io: Option<&Io>) -> nix::Result<Option<File>> {
    let fd = match io {
        None | Some(Io::Close(_)) => return Ok(None),
        Some(Io::Fd(redirect)) => sys::dup(redirect.source)?,
        Some(Io::Pipe(redirect)) => sys::dup(redirect.pipe_fd)?,
        Some(Io::Buffer(buffer)) => match buffer.write_fd() {
            Some(fd) => sys::dup(fd)?,
            None => return Err(Errno::EBADF),
        },
        Some(Io::File(redirect)) => fcntl::open(
            redirect.path.as_c_str(),
            redirect.flags | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o666),
        )?,
    };
    let _ = sys::set_cloexec(fd);
    Ok(Some(unsafe { File::from_raw_fd(fd) }))
}

impl<'a> Shell<'a> {
    /// Creates a job for `stages`, launches every stage, and, when `foreground` is set, waits
    /// for it to stop or finish. Returns the job's id.
    ///
    /// A stage that fails to launch is marked as finished along with every stage after it;
    /// the stages already running are still waited on (or left in the background) before
    /// the error is returned.
    pub fn launch(
        &mut self,
        command: &str,
        stages: Vec<Process>,
        block_io: IoChain,
        foreground: bool,
    ) -> Result<u32, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }

        let id = self.create_job(command, block_io, foreground);
        self.run_job(id, stages).map(|_| id)
    }

    /// Runs `stages` in the foreground with their standard output collected into memory, and
    /// returns the status of the last stage along with everything it wrote.
    pub fn capture(
        &mut self,
        command: &str,
        stages: Vec<Process>,
    ) -> Result<(Status, Vec<u8>), PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }

        let buffer = IoBuffer::create_clear_of(sys::STDOUT_FILENO, &|fd| {
            stages.iter().any(|stage| stage.io.claims(fd))
        })?;
        let mut block_io = IoChain::new();
        block_io.push(Io::Buffer(buffer));

        let id = self.create_job(command, block_io, true);
        if let Some(job) = self.job_mut(id) {
            job.set_flag(JobFlags::SKIP_NOTIFICATION, true);
            job.set_flag(JobFlags::TERMINAL, false);
        }

        let result = self.run_job(id, stages);
        let status = self.previous_status();
        let contents = self
            .job_mut(id)
            .and_then(|job| job.block_io_mut().take_buffer(sys::STDOUT_FILENO))
            .map(|mut buffer| {
                buffer.read_to_end();
                buffer.into_contents()
            })
            .unwrap_or_default();

        self.reap(false);
        self.set_previous_status(status);
        result.map(|_| (status, contents))
    }

    /// Launches `stages` into the job `id`, previously obtained from `create_job`, then marks
    /// the job as constructed and continues it if it is a foreground job.
    pub fn run_job(&mut self, id: u32, stages: Vec<Process>) -> Result<(), PipelineError> {
        let foreground = match self.job_mut(id) {
            Some(job) => {
                for stage in stages {
                    job.push_process(stage);
                }
                job.get_flag(JobFlags::FOREGROUND)
            }
            None => return Ok(()),
        };

        let result = self.spawn_stages(id);
        if let Err(ref why) = result {
            log::debug!("job {} failed to launch: {}", id, why);
            self.set_previous_status(why.status());
        }

        if let Some(job) = self.job_mut(id) {
            job.set_flag(JobFlags::CONSTRUCTED, true);
        }

        if foreground {
            self.continue_job(id, false);
        }
        result
    }

    fn spawn_stages(&mut self, id: u32) -> Result<(), PipelineError> {
        let count = self.job(id).map_or(0, |job| job.processes().len());
        let mut upstream: Option<Io> = None;

        for index in 0..count {
            let mut pipes = IoChain::new();
            if let Some(read) = upstream.take() {
                pipes.push(read);
            }

            if index + 1 < count {
                let (read, write) = match self.job(id) {
                    Some(job) => io::pipe_clear_of(&|fd| job.all_io().any(|io| io.fd() == fd))?,
                    None => return Ok(()),
                };
                pipes.push(Io::pipe(sys::STDOUT_FILENO, write));
                upstream = Some(Io::pipe(sys::STDIN_FILENO, read));
            }

            if let Err(why) = self.spawn_stage(id, index, &pipes) {
                if let PipelineError::CommandNotFound(ref program) = why {
                    eprintln!("jobsh: command not found: {}", program);
                }
                if let Some(job) = self.job_mut(id) {
                    job.mark_failed_with(index, why.status());
                }
                return Err(why);
            }
        }

        Ok(())
    }

    fn spawn_stage(&mut self, id: u32, index: usize, pipes: &IoChain) -> Result<(), PipelineError> {
        let kind = match self.job(id).and_then(|job| job.processes().get(index)) {
            Some(process) => process.kind(),
            None => return Ok(()),
        };

        match kind {
            ProcessKind::External => self.fork_stage(id, index, pipes),
            ProcessKind::Exec => self.exec_stage(id, index, pipes),
            ProcessKind::Builtin => self.run_builtin(id, index, pipes),
            ProcessKind::Function | ProcessKind::Block => self.run_block(id, index, pipes),
        }
    }

    fn fork_stage(&mut self, id: u32, index: usize, pipes: &IoChain) -> Result<(), PipelineError> {
        let terminal_fd = self.terminal().fd();
        let job = match self.job(id) {
            Some(job) => job,
            None => return Ok(()),
        };
        let process = &job.processes()[index];
        let tty = if job.get_flag(JobFlags::TERMINAL) && job.get_flag(JobFlags::FOREGROUND) {
            terminal_fd
        } else {
            None
        };
        let plan = ChildPlan::new(job, process, tty)?;

        match unsafe { unistd::fork() }.map_err(PipelineError::Fork)? {
            ForkResult::Child => plan.exec(job, pipes, &process.io),
            ForkResult::Parent { child } => {
                if job.get_flag(JobFlags::CONTROL) {
                    let pgid = job.pgid().unwrap_or(child);
                    // The child may already have exec'd, in which case its own call did this.
                    if let Err(why) = unistd::setpgid(child, pgid) {
                        log::trace!("setpgid({}, {}) in parent: {}", child, pgid, why);
                    }
                }
                log::debug!("job {} stage {} forked as {}", id, index, child);
                self.process_spawned(id, index, child);
                Ok(())
            }
        }
    }

    fn exec_stage(&mut self, id: u32, index: usize, pipes: &IoChain) -> Result<(), PipelineError> {
        let job = match self.job(id) {
            Some(job) => job,
            None => return Ok(()),
        };
        let process = &job.processes()[index];
        let plan = ChildPlan::new(job, process, None)?;

        for chain in &[job.block_io(), pipes, &process.io] {
            streams::apply(chain).map_err(|(_, why)| PipelineError::Exec(process.program().to_owned(), why))?;
        }
        sys::signals::reset_dispositions();

        let why = match unistd::execv(&plan.path, &plan.argv) {
            Err(why) => why,
            Ok(never) => match never {},
        };
        Err(PipelineError::Exec(process.program().to_owned(), why))
    }

    /// The descriptor that standard output of the stage at `index` ends up on.
    fn stage_output(&self, id: u32, index: usize, pipes: &IoChain) -> nix::Result<Option<File>> {
        let job = match self.job(id) {
            Some(job) => job,
            None => return Ok(None),
        };
        let own = job.processes().get(index).and_then(|p| p.io.get_io_for_fd(sys::STDOUT_FILENO));
        output_for(
            own.or_else(|| pipes.get_io_for_fd(sys::STDOUT_FILENO))
                .or_else(|| job.block_io().get_io_for_fd(sys::STDOUT_FILENO)),
        )
    }

    /// Builtins run on the shell's own thread. When their output goes anywhere other than the
    /// shell's standard output, it is handed to a writer thread so that a full pipe cannot
    /// block the shell.
    fn run_builtin(&mut self, id: u32, index: usize, pipes: &IoChain) -> Result<(), PipelineError> {
        let (main, argv) = match self.job(id).and_then(|job| job.processes().get(index)) {
            Some(process) => match process.builtin_main() {
                Some(main) => (main, process.argv().to_vec()),
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        let name = argv.first().cloned().unwrap_or_default();
        let target = self.stage_output(id, index, pipes).map_err(|why| PipelineError::Output(name.clone(), why))?;

        let mut out = Vec::new();
        let status = main(&argv, self, &mut out);

        match target {
            Some(mut file) => {
                let reaper = self.reaper().clone();
                let proc = InternalProc::spawn(&name, reaper, move || {
                    if let Err(why) = file.write_all(&out) {
                        log::debug!("builtin output was not fully written: {}", why);
                    }
                    status
                })
                .map_err(|why| PipelineError::Internal(name, why))?;
                if let Some(process) = self.job_mut(id).and_then(|job| job.processes.get_mut(index)) {
                    process.set_internal(proc);
                }
            }
            None => {
                let stdout = stdio::stdout();
                let mut stdout = stdout.lock();
                let _ = stdout.write_all(&out).and_then(|_| stdout.flush());
                if let Some(process) = self.job_mut(id).and_then(|job| job.processes.get_mut(index)) {
                    process.complete_with(ProcStatus::from_exit_code(status.as_os_code()));
                }
            }
        }

        Ok(())
    }

    fn run_block(&mut self, id: u32, index: usize, pipes: &IoChain) -> Result<(), PipelineError> {
        let (body, name) = match self.job_mut(id).and_then(|job| job.processes.get_mut(index)) {
            Some(process) => match process.take_body() {
                Some(body) => (body, process.program().to_owned()),
                None => return Ok(()),
            },
            None => return Ok(()),
        };
        let target = self.stage_output(id, index, pipes).map_err(|why| PipelineError::Output(name.clone(), why))?;

        let reaper = self.reaper().clone();
        let proc = InternalProc::spawn(&name, reaper, move || match target {
            Some(mut file) => body(&mut file),
            None => body(&mut stdio::stdout()),
        })
        .map_err(|why| PipelineError::Internal(name, why))?;

        if let Some(process) = self.job_mut(id).and_then(|job| job.processes.get_mut(index)) {
            process.set_internal(proc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs_are_resolved_on_path() {
        assert_eq!(resolve_program("./script"), Some(PathBuf::from("./script")));
        let sh = resolve_program("sh").expect("sh is on PATH");
        assert!(sh.ends_with("sh"));
        assert_eq!(resolve_program("surely-no-such-program-exists"), None);
    }

    #[test]
    fn failed_launches_map_to_statuses() {
        assert_eq!(
            PipelineError::CommandNotFound("nope".into()).status(),
            Status::UNKNOWN_COMMAND
        );
        assert_eq!(PipelineError::Exec("x".into(), Errno::EACCES).status(), Status::NOT_EXECUTABLE);
        assert_eq!(PipelineError::Fork(Errno::EAGAIN).status(), Status::EXEC_FAIL);
    }

    #[test]
    fn unredirected_output_is_left_to_the_caller() {
        assert!(output_for(None).unwrap().is_none());
        assert!(output_for(Some(&Io::Close(1))).unwrap().is_none());
    }
}
