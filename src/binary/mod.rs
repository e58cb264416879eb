//! Contains the binary logic of jobsh: reading lines, turning them into jobs, and keeping the
//! terminal straight in an interactive session.

mod parse;

use self::parse::{parse_line, Redirect, Stage, Statement};
use jobsh::{
    builtins,
    shell::{signals, JobFlags},
    Io, IoChain, PipelineError, Process, Shell, Status,
};
use nix::{
    fcntl::OFlag,
    sys::signal::{self, Signal},
    unistd::{self, Pid},
};
use std::io::{self, BufRead, Write};

pub const MAN_JOBSH: &str = r#"NAME
    jobsh - a small shell with job control

SYNOPSIS
    jobsh [ -h | --help ] [-i] [-c COMMANDS] [--no-job-control] [--job-control=MODE]
          [--direct-reap] [--huponexit] [-v]

DESCRIPTION
    jobsh runs pipelines of commands, separated by ';', with their stages joined by '|'. A
    trailing '&' runs a pipeline in the background. The redirections '<', '>', '>>', and
    'N>&M' are understood. The builtins jobs, fg, and bg manage jobs.

OPTIONS
    -c COMMANDS
        evaluates the given commands instead of reading from standard input.

    -i or --interactive
        runs as an interactive session even if standard input is not a terminal.

    --no-job-control
        never places jobs in process groups of their own.

    --job-control=all|interactive|none
        chooses which jobs are placed in process groups of their own.

    --direct-reap
        reaps children on the waiting thread instead of a dedicated reaper thread.

    --huponexit
        sends SIGHUP to every remaining job when the shell exits.

    -v or --version
        prints the version, platform and revision of jobsh then exits.
"#;

/// What the caller should do after a line has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(Status),
}

/// Claims the terminal for the shell's own process group, waiting in the background until the
/// terminal is ours to take.
pub fn take_terminal() -> nix::Result<()> {
    loop {
        let group = unistd::getpgrp();
        if unistd::tcgetpgrp(sys::STDIN_FILENO)? == group {
            break;
        }
        signal::killpg(group, Signal::SIGTTIN)?;
    }

    sys::signals::ignore_terminal_stops();

    let pid = unistd::getpid();
    if unistd::getpgrp() != pid {
        if let Err(why) = unistd::setpgid(pid, pid) {
            log::warn!("could not put the shell in its own process group: {}", why);
        }
    }
    unistd::tcsetpgrp(sys::STDIN_FILENO, pid)
}

fn chain_for(redirects: &[Redirect]) -> Result<IoChain, PipelineError> {
    let mut chain = IoChain::new();
    for redirect in redirects {
        let io = match redirect {
            Redirect::Input { fd, path } => Io::file(*fd, path, OFlag::O_RDONLY)?,
            Redirect::Output { fd, path, append } => {
                let mode = if *append { OFlag::O_APPEND } else { OFlag::O_TRUNC };
                Io::file(*fd, path, OFlag::O_WRONLY | OFlag::O_CREAT | mode)?
            }
            Redirect::Duplicate { fd, source } => Io::duplicate(*fd, *source),
        };
        chain.push(io);
    }
    Ok(chain)
}

fn process_for(stage: &Stage) -> Result<Process, PipelineError> {
    let io = chain_for(&stage.redirects)?;
    let argv = stage.argv.clone();
    let process = match argv[0].as_str() {
        "exec" if argv.len() > 1 => Process::exec(argv[1..].to_vec()),
        name => match builtins::builtin(name) {
            Some(main) => Process::builtin(argv, main),
            None => Process::external(argv),
        },
    };
    Ok(process.with_io(io))
}

fn exit_request(statement: &Statement) -> Option<Status> {
    match statement.stages.as_slice() {
        [stage] if stage.argv[0] == "exit" => Some(
            stage
                .argv
                .get(1)
                .and_then(|code| code.parse::<i32>().ok())
                .map_or(Status::SUCCESS, Status::from_exit_code),
        ),
        _ => None,
    }
}

fn run_statement(shell: &mut Shell<'_>, statement: Statement) -> Result<(), PipelineError> {
    let stages = statement.stages.iter().map(process_for).collect::<Result<Vec<_>, _>>()?;

    let id = shell.create_job(&statement.text, IoChain::new(), !statement.background);
    if let Some(job) = shell.job_mut(id) {
        job.set_flag(JobFlags::NEGATE, statement.negate);
    }
    shell.run_job(id, stages)?;

    if statement.background && shell.opts().interactive {
        let group = shell.job(id).and_then(|job| job.pgid()).map_or(0, Pid::as_raw);
        eprintln!("[{}] {}", id, group);
    }
    Ok(())
}

/// Runs every pipeline of `line`, then reports on jobs that changed state.
pub fn execute_line(shell: &mut Shell<'_>, line: &str) -> Flow {
    let statements = match parse_line(line) {
        Ok(statements) => statements,
        Err(why) => {
            eprintln!("jobsh: {}", why);
            shell.set_previous_status(Status::bad_argument(""));
            return Flow::Continue;
        }
    };

    shell.clear_cancel();
    let mut flow = Flow::Continue;
    for statement in statements {
        if shell.cancel_requested() || shell.exit_requested() {
            break;
        }
        if let Some(status) = exit_request(&statement) {
            flow = Flow::Exit(status);
            break;
        }

        match run_statement(shell, statement) {
            Ok(()) => (),
            Err(PipelineError::CommandNotFound(_)) => (),
            Err(why) => {
                eprintln!("jobsh: {}", why);
                shell.set_previous_status(why.status());
            }
        }
    }

    let interactive = shell.opts().interactive;
    shell.reap(interactive);
    shell.update_jiffies();
    // An interrupt at the prompt only cancels the line being typed.
    signals::PENDING.fetch_and(!signals::SIGINT, std::sync::atomic::Ordering::SeqCst);
    if shell.exit_requested() {
        flow = Flow::Exit(Status::TERMINATED);
    }
    flow
}

/// Reads lines from standard input until it ends or a line asks to exit.
pub fn execute_stdin(shell: &mut Shell<'_>) -> Status {
    let interactive = shell.opts().interactive;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        if interactive {
            print!("jobsh$ ");
            let _ = io::stdout().flush();
        }

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(why)) => {
                log::warn!("could not read from standard input: {}", why);
                break;
            }
            None => break,
        };

        if let Flow::Exit(status) = execute_line(shell, &line) {
            return status;
        }
    }

    shell.previous_status()
}
