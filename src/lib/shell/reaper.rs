//! Serializes every blocking wait on child processes.
//!
//! Only the reaper calls `waitpid(-1, ..)`. Statuses it collects land in a table that any
//! thread can drain for the pids it cares about. With the threaded strategy a background loop
//! does the waiting. It is started on demand when a child is spawned and exits once there are
//! no children left. Each spawn bumps a generation counter, so the loop can tell "no children
//! left" apart from "a child was forked after I last looked".

use super::{signals, status::ProcStatus};
use nix::{errno::Errno, unistd::Pid};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

/// How long a direct reaper sleeps between checks on a bounded wait.
const DIRECT_POLL: Duration = Duration::from_millis(10);

static GLOBAL: OnceLock<Arc<Reaper>> = OnceLock::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReapStrategy {
    /// A background thread blocks in `waitpid` on behalf of everyone.
    Thread,
    /// Whoever waits drains `waitpid` on their own thread, prompted by the SIGCHLD counter.
    Direct,
}

impl Default for ReapStrategy {
    fn default() -> Self { ReapStrategy::Thread }
}

/// How long to wait for a status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Check the table without blocking.
    Poll,
    After(Duration),
    Never,
}

impl Timeout {
    /// Zero polls, a negative value waits indefinitely, and a positive value is a deadline that
    /// many microseconds from now.
    pub fn from_micros(micros: i64) -> Self {
        match micros {
            0 => Timeout::Poll,
            micros if micros < 0 => Timeout::Never,
            micros => Timeout::After(Duration::from_micros(micros as u64)),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    generation: u32,
    running:    bool,
    interrupts: u64,
    statuses:   VecDeque<(Pid, ProcStatus)>,
}

#[derive(Debug)]
pub struct Reaper {
    strategy:     ReapStrategy,
    state:        Mutex<State>,
    cond:         Condvar,
    last_sigchld: AtomicU32,
}

impl Reaper {
    /// Creates an independent reaper. Only one reaper should be waiting on children at a time
    /// in any process, since each would steal statuses meant for the other.
    pub fn new(strategy: ReapStrategy) -> Arc<Self> {
        Arc::new(Reaper {
            strategy,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            last_sigchld: AtomicU32::new(signals::sigchld_generation()),
        })
    }

    /// The reaper shared by the whole process. The strategy of the first caller wins.
    pub fn global(strategy: ReapStrategy) -> Arc<Self> {
        let reaper = GLOBAL.get_or_init(|| Reaper::new(strategy)).clone();
        if reaper.strategy != strategy {
            log::debug!("reaper already running with the {:?} strategy", reaper.strategy);
        }
        reaper
    }

    pub fn strategy(&self) -> ReapStrategy { self.strategy }

    /// The background loop is alive.
    pub fn running(&self) -> bool { self.lock().running }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Must be called after every fork. Starts the background loop if it is not running.
    pub fn spawned(self: &Arc<Self>) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        if self.strategy == ReapStrategy::Direct || state.running {
            return;
        }

        state.running = true;
        let reaper = self.clone();
        let spawned = thread::Builder::new().name("jobsh: reaper".into()).spawn(move || reaper.run());
        if let Err(why) = spawned {
            log::error!("unable to start the reaper thread: {}", why);
            state.running = false;
        }
    }

    fn run(&self) {
        log::debug!("reaper started");
        let mut state = self.lock();
        loop {
            let generation = state.generation;
            drop(state);
            let result = sys::waitpid(-1, sys::WUNTRACED);
            state = self.lock();

            match result {
                Ok(Some((pid, status))) => {
                    state.statuses.push_back((pid, ProcStatus::from_raw(status)));
                    self.cond.notify_all();
                }
                Ok(None) => (),
                Err(Errno::EINTR) => {
                    state.interrupts = state.interrupts.wrapping_add(1);
                    self.cond.notify_all();
                }
                Err(Errno::ECHILD) if state.generation == generation => break,
                Err(Errno::ECHILD) => (),
                Err(why) => {
                    log::error!("reaper wait failed: {}", why);
                    break;
                }
            }
        }

        state.running = false;
        log::debug!("reaper exited");
    }

    /// Wakes every thread waiting on a status, without adding one.
    pub fn wake(&self) {
        let mut state = self.lock();
        state.interrupts = state.interrupts.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Records a status collected elsewhere.
    pub fn deposit(&self, pid: Pid, status: ProcStatus) {
        self.lock().statuses.push_back((pid, status));
        self.cond.notify_all();
    }

    /// Takes the first status for a pid accepted by `wanted` out of the table, waiting up to
    /// `timeout` for one to arrive. A wait ends early with `None` when the waiters are woken
    /// without a status.
    pub fn acquire<F: Fn(Pid) -> bool>(&self, wanted: F, timeout: Timeout) -> Option<(Pid, ProcStatus)> {
        let deadline = match timeout {
            Timeout::After(duration) => Some(Instant::now() + duration),
            _ => None,
        };

        let mut state = self.lock();
        let interrupts = state.interrupts;
        loop {
            if self.strategy == ReapStrategy::Direct {
                drop(state);
                let drained = self.drain_children(timeout == Timeout::Never);
                state = self.lock();
                if let Some(found) = take(&mut state, &wanted) {
                    return Some(found);
                }

                match drained {
                    // Nothing left that could ever produce a status.
                    Err(Errno::ECHILD) if timeout == Timeout::Never => return None,
                    Ok(_) | Err(_) if timeout == Timeout::Never => continue,
                    _ => (),
                }
            } else if let Some(found) = take(&mut state, &wanted) {
                return Some(found);
            }

            if timeout == Timeout::Poll || state.interrupts != interrupts {
                return None;
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let mut wait = deadline - now;
                    if self.strategy == ReapStrategy::Direct {
                        wait = wait.min(DIRECT_POLL);
                    }
                    self.cond.wait_timeout(state, wait).unwrap_or_else(PoisonError::into_inner).0
                }
                None => self.cond.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// A convenience over `acquire` for a single pid.
    pub fn acquire_pid(&self, pid: Pid, timeout: Timeout) -> Option<ProcStatus> {
        self.acquire(|candidate| candidate == pid, timeout).map(|(_, status)| status)
    }

    /// Number of statuses collected but not yet acquired.
    pub fn pending(&self) -> usize { self.lock().statuses.len() }

    /// Collects child statuses on the calling thread. Without `block`, nothing is done unless
    /// a SIGCHLD has arrived since the previous drain. With `block`, the first wait blocks
    /// until some child changes state.
    fn drain_children(&self, block: bool) -> nix::Result<usize> {
        let generation = signals::sigchld_generation();
        if !block && generation == self.last_sigchld.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut drained = 0;
        let result = loop {
            let options = if block && drained == 0 {
                sys::WUNTRACED
            } else {
                sys::WUNTRACED | sys::WNOHANG
            };

            match sys::waitpid(-1, options) {
                Ok(Some((pid, status))) => {
                    self.deposit(pid, ProcStatus::from_raw(status));
                    drained += 1;
                }
                Ok(None) => break Ok(drained),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) if drained > 0 => break Ok(drained),
                Err(why) => break Err(why),
            }
        };

        self.last_sigchld.store(generation, Ordering::Release);
        result
    }
}

fn take<F: Fn(Pid) -> bool>(state: &mut State, wanted: &F) -> Option<(Pid, ProcStatus)> {
    let index = state.statuses.iter().position(|&(pid, _)| wanted(pid))?;
    state.statuses.remove(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        sys::signal::Signal,
        unistd::{fork, ForkResult},
    };
    use serial_test_derive::serial;
    use std::thread;

    #[test]
    fn timeout_from_micros() {
        assert_eq!(Timeout::from_micros(0), Timeout::Poll);
        assert_eq!(Timeout::from_micros(-1), Timeout::Never);
        assert_eq!(Timeout::from_micros(1500), Timeout::After(Duration::from_micros(1500)));
    }

    #[test]
    fn acquire_erases_entry() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        let pid = Pid::from_raw(4242);
        reaper.deposit(pid, ProcStatus::from_exit_code(0));
        assert_eq!(reaper.acquire_pid(pid, Timeout::Poll), Some(ProcStatus::from_exit_code(0)));
        assert_eq!(reaper.acquire_pid(pid, Timeout::Poll), None);
        let start = Instant::now();
        assert_eq!(reaper.acquire_pid(pid, Timeout::After(Duration::from_millis(20))), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn statuses_are_taken_in_arrival_order() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        let pid = Pid::from_raw(77);
        reaper.deposit(Pid::from_raw(78), ProcStatus::from_exit_code(9));
        reaper.deposit(pid, ProcStatus::from_stop(Signal::SIGTSTP));
        reaper.deposit(pid, ProcStatus::from_exit_code(1));

        assert!(reaper.acquire_pid(pid, Timeout::Poll).unwrap().stopped());
        assert_eq!(reaper.acquire_pid(pid, Timeout::Poll).unwrap().exit_code(), 1);
        assert_eq!(reaper.pending(), 1);
        let any = reaper.acquire(|_| true, Timeout::Poll);
        assert_eq!(any, Some((Pid::from_raw(78), ProcStatus::from_exit_code(9))));
    }

    #[test]
    fn waiter_is_woken_by_deposit() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        let pid = Pid::from_raw(31337);
        let producer = reaper.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.deposit(pid, ProcStatus::from_exit_code(5));
        });

        let status = reaper.acquire_pid(pid, Timeout::Never).unwrap();
        assert_eq!(status.exit_code(), 5);
        handle.join().unwrap();
    }

    #[test]
    fn wake_interrupts_waiters() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        let waker = reaper.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.wake();
        });

        assert_eq!(reaper.acquire_pid(Pid::from_raw(1), Timeout::Never), None);
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn loop_exits_without_children_and_restarts_on_spawn() {
        let reaper = Reaper::new(ReapStrategy::Thread);
        for code in 1..=2 {
            let pid = match unsafe { fork() }.unwrap() {
                ForkResult::Child => sys::fork_exit(code),
                ForkResult::Parent { child } => child,
            };
            reaper.spawned();
            assert!(reaper.running());
            assert_eq!(reaper.acquire_pid(pid, Timeout::Never).unwrap().exit_code(), code);

            let deadline = Instant::now() + Duration::from_secs(5);
            while reaper.running() {
                assert!(Instant::now() < deadline, "reaper kept waiting with no children");
                thread::sleep(Duration::from_millis(5));
            }
        }
    }
}
