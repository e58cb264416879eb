use super::super::{
    events::Event,
    job::JobFlags,
    signals, Shell,
};
use nix::{sys::signal::Signal, unistd::Pid};

/// The job number only appears when there is more than one job to tell apart. `command` is
/// already truncated for display.
fn termination_message(
    job_id: u32,
    command: &str,
    several: bool,
    process: Option<(Pid, &str)>,
    signal: Signal,
) -> String {
    let (name, description) = (signal.as_str(), signals::describe(signal));
    match process {
        None if several => format!(
            "jobsh: Job {}, '{}' terminated by signal {} ({})",
            job_id, command, name, description
        ),
        None => format!("jobsh: '{}' terminated by signal {} ({})", command, name, description),
        Some((pid, program)) if several => format!(
            "jobsh: Process {}, '{}' from job {}, '{}' terminated by signal {} ({})",
            pid, program, job_id, command, name, description
        ),
        Some((pid, program)) => format!(
            "jobsh: Process {}, '{}' terminated by signal {} ({})",
            pid, program, name, description
        ),
    }
}

fn status_message(job_id: u32, command: &str, several: bool, what: &str) -> String {
    if several {
        format!("jobsh: Job {}, '{}' has {}", job_id, command, what)
    } else {
        format!("jobsh: '{}' has {}", command, what)
    }
}

impl<'a> Shell<'a> {
    /// Collects finished children, tells the user about jobs that were killed, stopped, or
    /// ended while nobody was watching, fires the matching events, and drops finished jobs
    /// from the job list. Jobs only take part when the shell is `interactive`, when they ran
    /// in the foreground, or when they ask to be reaped silently.
    ///
    /// Returns whether anything was printed. A reap that starts while another is in progress,
    /// as from an event handler, does nothing.
    pub fn reap(&mut self, interactive: bool) -> bool {
        if self.reaping {
            return false;
        }
        self.reaping = true;

        self.process_mark_finished_children(false);
        let saved = self.previous_status();
        let several = self.jobs.len() > 1;

        let mut found = false;
        let mut events = Vec::new();
        let mut messages = Vec::new();
        let mut index = 0;

        while index < self.jobs.len() {
            let job = &mut self.jobs[index];
            let skip = job.get_flag(JobFlags::SKIP_NOTIFICATION);
            let foreground = job.get_flag(JobFlags::FOREGROUND);
            if !skip && !interactive && !foreground {
                index += 1;
                continue;
            }

            let (job_id, command) = (job.id(), job.truncated_command());
            let single = job.processes.len() == 1;
            for process in job.processes.iter_mut() {
                if !process.completed || process.reported {
                    continue;
                }
                process.reported = true;

                let pid = match process.pid() {
                    Some(pid) => pid,
                    None => continue,
                };
                events.push(Event::ProcessExit { pid, status: process.status.event_code() });

                let signal = match process.status.signal() {
                    Some(Signal::SIGPIPE) | None => continue,
                    Some(signal) => signal,
                };

                if single {
                    job.flags.set(JobFlags::NOTIFIED, true);
                }
                if !skip && !(signal == Signal::SIGINT && foreground) {
                    let program = if single { None } else { Some((pid, process.program())) };
                    messages.push(termination_message(job_id, &command, several, program, signal));
                    found = true;
                }
            }

            if job.is_completed() {
                if !foreground && !skip && !job.get_flag(JobFlags::NOTIFIED) {
                    messages.push(status_message(job_id, &command, several, "ended"));
                    found = true;
                }

                let pgid = job.pgid().map_or(0, Pid::as_raw);
                events.push(Event::JobExit { pgid: -pgid, job_id });
                log::debug!("job {} ('{}') removed", job_id, command);
                self.jobs.remove(index);
                continue;
            }

            if job.is_stopped() && !job.get_flag(JobFlags::NOTIFIED) {
                if !skip {
                    messages.push(status_message(job_id, &command, several, "stopped"));
                    found = true;
                }
                job.set_flag(JobFlags::NOTIFIED, true);
            }
            index += 1;
        }

        for message in messages {
            self.notify(format_args!("{}", message));
        }

        let Shell { handlers, previous_status, .. } = self;
        for event in &events {
            log::trace!("firing {}", event);
            for handler in handlers.iter_mut() {
                handler(event, &mut *previous_status);
            }
        }

        self.set_previous_status(saved);
        self.reaping = false;
        found
    }
}

#[cfg(test)]
mod tests {
    use super::{
        super::super::{
            io::IoChain,
            process::Process,
            reaper::{ReapStrategy, Reaper},
            status::{ProcStatus, Status},
            JobControlMode,
        },
        *,
    };
    use std::{cell::RefCell, io::Write, rc::Rc};

    /// A notification sink the test can read back.
    #[derive(Clone, Default)]
    struct Output(Rc<RefCell<Vec<u8>>>);

    impl Write for Output {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
    }

    impl Output {
        fn text(&self) -> String { String::from_utf8_lossy(&self.0.borrow()).into_owned() }
    }

    fn shell<'a>(out: Output) -> Shell<'a> {
        Shell::builder()
            .job_control(JobControlMode::None)
            .reaper(Reaper::new(ReapStrategy::Thread))
            .notifications(out)
            .build()
    }

    fn finished(shell: &mut Shell<'_>, command: &str, foreground: bool, statuses: &[ProcStatus]) -> u32 {
        let id = shell.create_job(command, IoChain::new(), foreground);
        let job = shell.job_mut(id).unwrap();
        for (n, status) in statuses.iter().enumerate() {
            let mut process = Process::external(vec![format!("stage{}", n)]);
            process.set_pid(Pid::from_raw(90_000 + n as i32));
            process.complete_with(*status);
            job.push_process(process);
        }
        job.set_flag(JobFlags::CONSTRUCTED, true);
        id
    }

    #[test]
    fn completed_jobs_fire_events_and_leave() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let events = Rc::new(RefCell::new(Vec::new()));
        let seen = events.clone();
        shell.add_event_handler(Box::new(move |event: &Event, status: &mut Status| {
            seen.borrow_mut().push(*event);
            *status = Status::FAILURE;
        }));
        shell.set_previous_status(Status::SUCCESS);

        let ok = ProcStatus::from_exit_code(0);
        let id = finished(&mut shell, "stage0 | stage1", true, &[ok, ok]);
        assert!(!shell.reap(false));

        assert_eq!(*events.borrow(), vec![
            Event::ProcessExit { pid: Pid::from_raw(90_000), status: 0 },
            Event::ProcessExit { pid: Pid::from_raw(90_001), status: 0 },
            Event::JobExit { pgid: 0, job_id: id },
        ]);
        assert!(shell.job(id).is_none());
        assert_eq!(shell.previous_status(), Status::SUCCESS);
        assert_eq!(out.text(), "");
    }

    #[test]
    fn background_jobs_wait_for_an_interactive_reap() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let id = finished(&mut shell, "sleep 1", false, &[ProcStatus::from_exit_code(0)]);

        assert!(!shell.reap(false));
        assert!(shell.job(id).is_some());

        assert!(shell.reap(true));
        assert!(shell.job(id).is_none());
        assert_eq!(out.text(), "jobsh: 'sleep 1' has ended\n");
    }

    #[test]
    fn signal_deaths_are_reported_once() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let killed = ProcStatus::from_signal(Signal::SIGTERM);
        let id = finished(&mut shell, "yes | head", false, &[killed, ProcStatus::from_exit_code(0)]);
        let other = finished(&mut shell, "long", false, &[ProcStatus::from_signal(Signal::SIGKILL)]);

        assert!(shell.reap(true));
        let text = out.text();
        assert!(text.contains(
            "jobsh: Process 90000, 'stage0' from job 1, 'yes | head' terminated by signal SIGTERM \
             (Polite quit request)\n"
        ));
        assert!(text.contains("jobsh: Job 1, 'yes | head' has ended\n"));
        assert!(text.contains("jobsh: Job 2, 'long' terminated by signal SIGKILL (Forced quit)\n"));
        assert!(!text.contains("'long' has ended"));
        assert!(shell.job(id).is_none() && shell.job(other).is_none());

        assert!(!shell.reap(true));
    }

    #[test]
    fn lone_jobs_are_not_numbered() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let killed = ProcStatus::from_signal(Signal::SIGTERM);
        finished(&mut shell, "yes | head", false, &[killed, ProcStatus::from_exit_code(0)]);
        assert!(shell.reap(true));
        assert_eq!(
            out.text(),
            "jobsh: Process 90000, 'stage0' terminated by signal SIGTERM (Polite quit request)\n\
             jobsh: 'yes | head' has ended\n"
        );

        let out = Output::default();
        let mut shell = self::shell(out.clone());
        finished(&mut shell, "long", false, &[ProcStatus::from_signal(Signal::SIGKILL)]);
        assert!(shell.reap(true));
        assert_eq!(out.text(), "jobsh: 'long' terminated by signal SIGKILL (Forced quit)\n");
    }

    #[test]
    fn long_commands_are_cut_in_messages() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let command = "sleep 1000000000000000000000000000000";
        let id = finished(&mut shell, command, false, &[ProcStatus::from_exit_code(0)]);
        let expected = shell.job(id).unwrap().truncated_command();
        assert_eq!(expected.chars().count(), 32);
        assert!(expected.ends_with('\u{2026}'));

        assert!(shell.reap(true));
        assert_eq!(out.text(), format!("jobsh: '{}' has ended\n", expected));
    }

    #[test]
    fn broken_pipes_and_foreground_interrupts_are_quiet() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        finished(&mut shell, "cat big", true, &[
            ProcStatus::from_signal(Signal::SIGPIPE),
            ProcStatus::from_signal(Signal::SIGINT),
        ]);
        assert!(!shell.reap(true));
        assert_eq!(out.text(), "");
    }

    #[test]
    fn stopped_jobs_are_announced_once() {
        let out = Output::default();
        let mut shell = shell(out.clone());
        let id = shell.create_job("vim", IoChain::new(), false);
        let job = shell.job_mut(id).unwrap();
        let mut process = Process::external(vec!["vim".into()]);
        process.set_pid(Pid::from_raw(90_100));
        process.stopped = true;
        job.push_process(process);
        job.set_flag(JobFlags::CONSTRUCTED, true);

        assert!(shell.reap(true));
        assert!(!shell.reap(true));
        assert_eq!(out.text(), "jobsh: 'vim' has stopped\n");
        assert!(shell.job(id).unwrap().get_flag(JobFlags::NOTIFIED));
    }
}
