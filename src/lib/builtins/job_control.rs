//! Contains the `jobs`, `bg`, and `fg` commands that manage job control in the shell.

use super::Status;
use crate::shell::{Job, JobFlags, JobState, Shell};
use smallvec::SmallVec;
use std::io::Write;

/// What `jobs` prints for each job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Listing {
    Default,
    Pids,
    Commands,
    Group,
}

/// Jobs that are still being put together, like the one running this builtin, are not shown.
fn is_listed(job: &Job) -> bool { job.get_flag(JobFlags::CONSTRUCTED) && !job.is_completed() }

/// Parses `N` or `%N`.
fn parse_job_id(arg: &str) -> Option<u32> {
    arg.strip_prefix('%').unwrap_or(arg).parse::<u32>().ok().filter(|&id| id != 0)
}

#[cfg(target_os = "linux")]
const CPU_HEADER: &str = "CPU\t";
#[cfg(not(target_os = "linux"))]
const CPU_HEADER: &str = "";

/// The CPU column, present only where per-process CPU times can be read.
#[cfg(target_os = "linux")]
fn cpu_column(job: &Job) -> String { format!("{}%\t", job.cpu_use()) }
#[cfg(not(target_os = "linux"))]
fn cpu_column(_: &Job) -> String { String::new() }

fn print_job(job: &Job, listing: Listing, header: bool, out: &mut dyn Write) {
    let _ = match listing {
        Listing::Default => {
            if header {
                let _ = writeln!(out, "Job\tGroup\t{}State\tCommand", CPU_HEADER);
            }
            let group = job.pgid().map_or(0, |pgid| pgid.as_raw());
            writeln!(
                out,
                "{}\t{}\t{}{}\t{}",
                job.id(),
                group,
                cpu_column(job),
                job.state(),
                job.command()
            )
        }
        Listing::Group => {
            if header {
                let _ = writeln!(out, "Group");
            }
            writeln!(out, "{}", job.pgid().map_or(0, |pgid| pgid.as_raw()))
        }
        Listing::Pids => {
            if header {
                let _ = writeln!(out, "Process");
            }
            job.processes()
                .iter()
                .filter_map(|p| p.pid())
                .try_for_each(|pid| writeln!(out, "{}", pid))
        }
        Listing::Commands => {
            if header {
                let _ = writeln!(out, "Command");
            }
            job.processes().iter().try_for_each(|p| writeln!(out, "{}", p.program()))
        }
    };
}

/// Display the jobs the shell knows about.
pub fn jobs(args: &[String], shell: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    let mut listing = Listing::Default;
    let mut last = false;
    let mut selected: SmallVec<[u32; 8]> = SmallVec::new();

    for arg in args {
        match arg.as_str() {
            "-p" | "--pid" => listing = Listing::Pids,
            "-c" | "--command" => listing = Listing::Commands,
            "-g" | "--group" => listing = Listing::Group,
            "-l" | "--last" => last = true,
            _ => match parse_job_id(arg) {
                Some(id) => selected.push(id),
                None => return Status::bad_argument(format!("jobs: '{}' is not a job id", arg)),
            },
        }
    }

    if !selected.is_empty() {
        let mut header = true;
        for id in selected {
            match shell.job(id).filter(|job| is_listed(job)) {
                Some(job) => print_job(job, listing, header, out),
                None => return Status::error(format!("jobs: No suitable job: {}", id)),
            }
            header = false;
        }
        return Status::SUCCESS;
    }

    let mut found = false;
    for job in shell.jobs().filter(|job| is_listed(job)) {
        print_job(job, listing, !found, out);
        found = true;
        if last {
            break;
        }
    }

    if !found {
        let _ = writeln!(out, "jobs: There are no jobs");
        return Status::FAILURE;
    }
    Status::SUCCESS
}

/// Hands the terminal to the given job, or to the most recent job that is stopped or in the
/// background, and waits on it. The job is resumed if it was stopped.
pub fn fg(args: &[String], shell: &mut Shell<'_>, _out: &mut dyn Write) -> Status {
    let id = match args {
        [] => {
            let candidate = shell.jobs().find(|job| {
                is_listed(job)
                    && job.get_flag(JobFlags::CONTROL)
                    && (job.is_stopped() || !job.get_flag(JobFlags::FOREGROUND))
            });
            match candidate {
                Some(job) => job.id(),
                None => return Status::error("fg: There are no suitable jobs"),
            }
        }
        [arg] => match parse_job_id(arg) {
            Some(id) => id,
            None => return Status::bad_argument(format!("fg: '{}' is not a job id", arg)),
        },
        _ => return Status::bad_argument("fg: Too many arguments"),
    };

    let (command, stopped) = match shell.job(id).filter(|job| is_listed(job)) {
        Some(job) if !job.get_flag(JobFlags::CONTROL) => {
            return Status::error(format!(
                "fg: Can't put job {}, '{}' to foreground because it is not under job control",
                id,
                job.command()
            ))
        }
        Some(job) => (job.command().to_owned(), job.is_stopped()),
        None => return Status::error(format!("fg: No suitable job: {}", id)),
    };

    eprintln!("Send job {}, '{}' to foreground", id, command);
    if let Some(job) = shell.job_mut(id) {
        job.set_flag(JobFlags::FOREGROUND, true);
    }

    match shell.continue_job(id, stopped) {
        Some(JobState::Stopped) | Some(JobState::Completed) | None => shell.previous_status(),
        Some(_) => Status::SUCCESS,
    }
}

/// Resumes stopped jobs in the background: the given ones, or the most recent stopped job.
pub fn bg(args: &[String], shell: &mut Shell<'_>, _out: &mut dyn Write) -> Status {
    let mut ids: SmallVec<[u32; 8]> = SmallVec::new();
    if args.is_empty() {
        let candidate = shell.jobs().find(|job| {
            is_listed(job) && job.get_flag(JobFlags::CONTROL) && job.is_stopped()
        });
        match candidate {
            Some(job) => ids.push(job.id()),
            None => return Status::error("bg: There are no suitable jobs"),
        }
    } else {
        for arg in args {
            match parse_job_id(arg) {
                Some(id) => ids.push(id),
                None => return Status::bad_argument(format!("bg: '{}' is not a job id", arg)),
            }
        }
    }

    for id in ids {
        let command = match shell.job(id).filter(|job| is_listed(job)) {
            Some(job) if !job.get_flag(JobFlags::CONTROL) => {
                return Status::error(format!(
                    "bg: Can't put job {}, '{}' to background because it is not under job \
                     control",
                    id,
                    job.command()
                ))
            }
            Some(job) => job.command().to_owned(),
            None => return Status::error(format!("bg: No suitable job: {}", id)),
        };

        eprintln!("Send job {} '{}' to background", id, command);
        if let Some(job) = shell.job_mut(id) {
            job.set_flag(JobFlags::FOREGROUND, false);
        }
        shell.continue_job(id, true);
    }

    Status::SUCCESS
}
