extern crate jobsh_sys as sys;

mod binary;

use self::binary::{execute_line, execute_stdin, take_terminal, Flow, MAN_JOBSH};
use jobsh::{JobControlMode, Options, ReapStrategy, Shell, Status};
use std::{env, process};

fn parse_mode(mode: &str) -> Option<JobControlMode> {
    match mode {
        "all" | "full" => Some(JobControlMode::All),
        "interactive" => Some(JobControlMode::Interactive),
        "none" => Some(JobControlMode::None),
        _ => None,
    }
}

fn main() {
    env_logger::init();

    let mut opts = Options::default();
    let mut command = None;
    let mut force_interactive = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => match args.next() {
                Some(commands) => command = Some(commands),
                None => {
                    eprintln!("jobsh: -c requires an argument");
                    process::exit(Status::bad_argument("").as_os_code());
                }
            },
            "-i" | "--interactive" => force_interactive = true,
            "--no-job-control" => opts.job_control = JobControlMode::None,
            "--direct-reap" => opts.reap = ReapStrategy::Direct,
            "--huponexit" => opts.huponexit = true,
            "-v" | "--version" => {
                println!("{}", jobsh::version());
                return;
            }
            "-h" | "--help" => {
                println!("{}", MAN_JOBSH);
                return;
            }
            other => match other.strip_prefix("--job-control=").map(parse_mode) {
                Some(Some(mode)) => opts.job_control = mode,
                _ => {
                    eprintln!("jobsh: unrecognized option: {}", other);
                    process::exit(Status::bad_argument("").as_os_code());
                }
            },
        }
    }

    opts.interactive =
        force_interactive || (command.is_none() && atty::is(atty::Stream::Stdin));
    if opts.interactive && opts.job_control != JobControlMode::None {
        if let Err(why) = take_terminal() {
            log::warn!("could not take control of the terminal: {}", why);
        }
    }

    let mut shell = Shell::builder().options(opts).signal_handlers(true).build();
    let status = match command {
        Some(command) => match execute_line(&mut shell, &command) {
            Flow::Exit(status) => status,
            Flow::Continue => shell.previous_status(),
        },
        None => execute_stdin(&mut shell),
    };

    if shell.opts().huponexit || shell.exit_requested() {
        shell.hup_jobs();
    }
    process::exit(status.as_os_code());
}
