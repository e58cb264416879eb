//! Runs alone: it installs the shell's signal handlers and signals its own process.

use jobsh::{shell::signals, IoChain, JobState, Process, ReapStrategy, Reaper, Shell};
use nix::{
    sys::signal::{self, Signal},
    unistd,
};
use std::{
    io, thread,
    time::{Duration, Instant},
};

#[test]
fn termination_requests_end_foreground_waits() {
    let mut shell = Shell::builder()
        .reaper(Reaper::global(ReapStrategy::Thread))
        .signal_handlers(true)
        .notifications(io::sink())
        .build();

    let sender = thread::spawn(|| {
        thread::sleep(Duration::from_millis(300));
        signal::kill(unistd::getpid(), Signal::SIGTERM).unwrap();
    });

    let start = Instant::now();
    let stage = Process::external(vec!["sleep".into(), "5".into()]);
    let id = shell.launch("sleep 5", vec![stage], IoChain::new(), true).unwrap();
    sender.join().unwrap();

    assert!(start.elapsed() < Duration::from_secs(3), "waited {:?}", start.elapsed());
    assert_eq!(shell.job(id).map(|job| job.state()), Some(JobState::RunningForeground));
    assert!(shell.exit_requested());
    assert_ne!(signals::take_pending() & signals::SIGTERM, 0);
    assert!(!shell.exit_requested());

    assert!(shell.signal_job(id, Signal::SIGKILL));
    let deadline = Instant::now() + Duration::from_secs(10);
    while shell.job_count() != 0 {
        assert!(Instant::now() < deadline, "the killed job was never reaped");
        shell.reap(true);
        thread::sleep(Duration::from_millis(10));
    }
}
