use super::{
    io::IoChain,
    reaper::Reaper,
    status::{ProcStatus, Status},
    Shell,
};
use nix::unistd::Pid;
use std::{
    fmt,
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

/// A builtin runs on the shell's own thread, with access to the shell, writing to `out`.
pub type BuiltinFunction = fn(&[String], &mut Shell<'_>, &mut dyn Write) -> Status;

/// The body of a function or block stage, evaluated on a worker thread.
pub type BlockBody = Box<dyn FnOnce(&mut dyn Write) -> Status + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    External,
    Builtin,
    Function,
    Block,
    /// Replaces the shell itself.
    Exec,
}

/// Stands in for an OS process when a stage is evaluated on a worker thread of the shell.
#[derive(Debug, Default)]
pub struct InternalProc {
    exited: AtomicBool,
    status: AtomicI32,
}

impl InternalProc {
    /// Runs `work` on a new thread. Once it returns, its status is published and every thread
    /// waiting on the reaper is woken up so that it can notice.
    pub fn spawn<F>(name: &str, reaper: Arc<Reaper>, work: F) -> io::Result<Arc<Self>>
    where
        F: FnOnce() -> Status + Send + 'static,
    {
        let proc = Arc::new(InternalProc::default());
        let handle = proc.clone();
        thread::Builder::new().name(format!("jobsh: {}", name)).spawn(move || {
            let status = work();
            handle.exit(status);
            reaper.wake();
        })?;
        Ok(proc)
    }

    fn exit(&self, status: Status) {
        self.status.store(ProcStatus::from_exit_code(status.as_os_code()).raw(), Ordering::Relaxed);
        self.exited.store(true, Ordering::Release);
    }

    pub fn exited(&self) -> bool { self.exited.load(Ordering::Acquire) }

    /// Only meaningful once `exited` returns true.
    pub fn status(&self) -> ProcStatus { ProcStatus::from_raw(self.status.load(Ordering::Relaxed)) }
}

/// One stage of a pipeline.
pub struct Process {
    kind:                 ProcessKind,
    argv:                 Vec<String>,
    pub io:               IoChain,
    pid:                  Option<Pid>,
    internal:             Option<Arc<InternalProc>>,
    builtin:              Option<BuiltinFunction>,
    body:                 Option<BlockBody>,
    pub(crate) completed: bool,
    pub(crate) stopped:   bool,
    pub(crate) reported:  bool,
    pub(crate) status:    ProcStatus,
    last_jiffies:         u64,
    last_time:            Instant,
}

impl Process {
    fn new(kind: ProcessKind, argv: Vec<String>) -> Self {
        Process {
            kind,
            argv,
            io: IoChain::new(),
            pid: None,
            internal: None,
            builtin: None,
            body: None,
            completed: false,
            stopped: false,
            reported: false,
            status: ProcStatus::default(),
            last_jiffies: 0,
            last_time: Instant::now(),
        }
    }

    pub fn external(argv: Vec<String>) -> Self { Process::new(ProcessKind::External, argv) }

    pub fn exec(argv: Vec<String>) -> Self { Process::new(ProcessKind::Exec, argv) }

    pub fn builtin(argv: Vec<String>, main: BuiltinFunction) -> Self {
        let mut process = Process::new(ProcessKind::Builtin, argv);
        process.builtin = Some(main);
        process
    }

    pub fn function(argv: Vec<String>, body: BlockBody) -> Self {
        let mut process = Process::new(ProcessKind::Function, argv);
        process.body = Some(body);
        process
    }

    pub fn block(argv: Vec<String>, body: BlockBody) -> Self {
        let mut process = Process::new(ProcessKind::Block, argv);
        process.body = Some(body);
        process
    }

    pub fn with_io(mut self, io: IoChain) -> Self {
        self.io = io;
        self
    }

    pub fn kind(&self) -> ProcessKind { self.kind }

    pub fn argv(&self) -> &[String] { &self.argv }

    /// The name of the program, or an empty string for a block without arguments.
    pub fn program(&self) -> &str { self.argv.first().map_or("", String::as_str) }

    pub fn pid(&self) -> Option<Pid> { self.pid }

    pub fn internal(&self) -> Option<&Arc<InternalProc>> { self.internal.as_ref() }

    pub fn is_completed(&self) -> bool { self.completed }

    pub fn is_stopped(&self) -> bool { self.stopped }

    pub fn status(&self) -> ProcStatus { self.status }

    /// Records the OS process backing this stage. A stage is only ever spawned once.
    pub(crate) fn set_pid(&mut self, pid: Pid) {
        debug_assert!(self.pid.is_none(), "stage spawned twice");
        if self.pid.is_none() {
            self.pid = Some(pid);
        }
    }

    pub(crate) fn set_internal(&mut self, proc: Arc<InternalProc>) { self.internal = Some(proc); }

    pub(crate) fn builtin_main(&self) -> Option<BuiltinFunction> { self.builtin }

    pub(crate) fn take_body(&mut self) -> Option<BlockBody> { self.body.take() }

    /// Starts a new CPU usage sampling interval.
    pub fn update_jiffies(&mut self) {
        self.last_time = Instant::now();
        self.last_jiffies = self.jiffies();
    }

    /// The share of one CPU the process has used since the interval began.
    pub fn cpu_use(&self) -> f64 {
        let elapsed = self.last_time.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let used = self.jiffies().saturating_sub(self.last_jiffies);
        used as f64 / (elapsed * sys::clock_ticks() as f64)
    }

    fn jiffies(&self) -> u64 {
        self.pid.and_then(|pid| sys::process_jiffies(pid.as_raw())).unwrap_or(0)
    }

    /// Marks this stage as finished without an OS status, as for a builtin that ran inline.
    pub(crate) fn complete_with(&mut self, status: ProcStatus) {
        self.status = status;
        self.completed = true;
        self.stopped = false;
    }

    /// A stage that is still waiting on an OS status. Stages run in-process, or that never
    /// obtained a pid, never will.
    pub(crate) fn awaits_status(&self) -> Option<Pid> {
        if self.completed {
            None
        } else {
            self.pid
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("kind", &self.kind)
            .field("argv", &self.argv)
            .field("pid", &self.pid)
            .field("completed", &self.completed)
            .field("stopped", &self.stopped)
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{super::reaper::ReapStrategy, *};
    use std::{thread::sleep, time::Duration};

    #[test]
    fn internal_proc_publishes_status() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        let proc = InternalProc::spawn("test", reaper, || Status::from_exit_code(4)).unwrap();
        while !proc.exited() {
            sleep(Duration::from_millis(1));
        }
        assert_eq!(proc.status().exit_code(), 4);
    }

    #[test]
    fn completion_clears_stop() {
        let mut process = Process::external(vec!["sleep".into(), "1".into()]);
        process.stopped = true;
        process.complete_with(ProcStatus::from_exit_code(0));
        assert!(process.is_completed());
        assert!(!process.is_stopped());
        assert_eq!(process.awaits_status(), None);
        assert_eq!(process.program(), "sleep");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn cpu_use_is_sampled_between_updates() {
        let mut idle = Process::external(vec!["idle".into()]);
        idle.update_jiffies();
        assert_eq!(idle.cpu_use(), 0.0);

        // Stands in for a busy child: the test process itself.
        let mut busy = Process::external(vec!["busy".into()]);
        busy.set_pid(nix::unistd::getpid());
        busy.update_jiffies();
        let start = std::time::Instant::now();
        let mut spin = 0u64;
        while start.elapsed() < Duration::from_millis(300) {
            spin = spin.wrapping_add(1);
        }
        assert!(spin > 0);
        assert!(busy.cpu_use() > 0.0);
    }

    #[test]
    fn only_spawned_stages_await_status() {
        let mut process = Process::external(vec!["true".into()]);
        assert_eq!(process.awaits_status(), None);
        process.set_pid(Pid::from_raw(42));
        assert_eq!(process.awaits_status(), Some(Pid::from_raw(42)));
    }
}
