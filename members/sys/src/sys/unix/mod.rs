pub mod signals;

use nix::{
    errno::Errno,
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    libc::{self, c_int},
    unistd::{self, Pid, SysconfVar},
};
use std::os::unix::io::RawFd;

pub use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO, WNOHANG, WUNTRACED};

/// Calls `waitpid(2)` and hands back the raw status alongside the pid. `Ok(None)` is returned
/// when `WNOHANG` was requested and no child has changed state yet.
pub fn waitpid(pid: i32, options: c_int) -> nix::Result<Option<(Pid, i32)>> {
    let mut status = 0;
    match unsafe { libc::waitpid(pid, &mut status, options) } {
        -1 => Err(Errno::last()),
        0 => Ok(None),
        pid => Ok(Some((Pid::from_raw(pid), status))),
    }
}

pub fn wexitstatus(status: i32) -> i32 { libc::WEXITSTATUS(status) }
pub fn wifexited(status: i32) -> bool { libc::WIFEXITED(status) }
pub fn wifstopped(status: i32) -> bool { libc::WIFSTOPPED(status) }
pub fn wifcontinued(status: i32) -> bool { libc::WIFCONTINUED(status) }
pub fn wifsignaled(status: i32) -> bool { libc::WIFSIGNALED(status) }
pub fn wtermsig(status: i32) -> i32 { libc::WTERMSIG(status) }
pub fn wstopsig(status: i32) -> i32 { libc::WSTOPSIG(status) }

/// Builds the raw status `waitpid` would report for a child that exited with `code`, or that
/// was killed by `signal` when `code` is zero. Linux and the BSDs share this layout.
pub const fn w_exitcode(code: i32, signal: i32) -> i32 { ((code & 0xff) << 8) | (signal & 0x7f) }

/// Builds the raw status `waitpid` would report for a child stopped by `signal`.
pub const fn w_stopcode(signal: i32) -> i32 { ((signal & 0xff) << 8) | 0x7f }

/// Marks the descriptor so that it does not leak into exec'd children.
pub fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(|_| ())
}

/// Toggles `O_NONBLOCK` on the descriptor, leaving its other status flags alone.
pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<()> {
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map(|_| ())
}

/// True if the descriptor refers to an open file description.
pub fn is_open(fd: RawFd) -> bool { fcntl(fd, FcntlArg::F_GETFD).is_ok() }

/// Duplicates a descriptor, retrying when interrupted by a signal.
pub fn dup(fd: RawFd) -> nix::Result<RawFd> {
    loop {
        match unistd::dup(fd) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// Makes `target` refer to `source`. When both are the same descriptor, the close-on-exec flag
/// is cleared instead, since `dup2` would be a no-op and the descriptor must survive exec.
pub fn redirect(source: RawFd, target: RawFd) -> nix::Result<()> {
    if source == target {
        return fcntl(target, FcntlArg::F_SETFD(FdFlag::empty())).map(|_| ());
    }

    loop {
        match unistd::dup2(source, target) {
            Err(Errno::EINTR) => continue,
            result => return result.map(|_| ()),
        }
    }
}

/// Writes each slice to the descriptor without allocating, ignoring failures. Intended for
/// reporting errors from a forked child before it exits.
pub fn write_raw(fd: RawFd, parts: &[&[u8]]) {
    for part in parts {
        let _ = unistd::write(fd, part);
    }
}

/// Exits immediately without running destructors or flushing buffers owned by the parent.
pub fn fork_exit(status: i32) -> ! { unsafe { libc::_exit(status) } }

/// Clock ticks per second, the unit of the CPU times the kernel reports.
pub fn clock_ticks() -> u64 {
    match unistd::sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as u64,
        _ => 100,
    }
}

/// CPU time the process and its reaped children have used so far, in clock ticks.
#[cfg(target_os = "linux")]
pub fn process_jiffies(pid: i32) -> Option<u64> {
    if pid <= 0 {
        return None;
    }
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    stat_jiffies(&stat)
}

#[cfg(not(target_os = "linux"))]
pub fn process_jiffies(_pid: i32) -> Option<u64> { None }

/// Sums utime, stime, cutime and cstime out of a `/proc/<pid>/stat` line. The command name
/// may itself contain spaces and parentheses, so fields are counted from its closing paren.
#[cfg(target_os = "linux")]
fn stat_jiffies(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // `rest` starts at the state, the third field; utime is the fourteenth.
    let times = rest.split_whitespace().skip(11).take(4);
    let mut total = 0u64;
    let mut count = 0;
    for field in times {
        total += field.parse::<i64>().ok()?.max(0) as u64;
        count += 1;
    }
    if count == 4 { Some(total) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_exit_status() {
        let status = w_exitcode(3, 0);
        assert!(wifexited(status));
        assert!(!wifsignaled(status));
        assert_eq!(wexitstatus(status), 3);
    }

    #[test]
    fn synthetic_signal_status() {
        let status = w_exitcode(0, libc::SIGKILL);
        assert!(wifsignaled(status));
        assert!(!wifexited(status));
        assert_eq!(wtermsig(status), libc::SIGKILL);
    }

    #[test]
    fn synthetic_stop_status() {
        let status = w_stopcode(libc::SIGTSTP);
        assert!(wifstopped(status));
        assert!(!wifexited(status));
        assert_eq!(wstopsig(status), libc::SIGTSTP);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn stat_lines_yield_cpu_times() {
        let line = "4242 (my (odd) prog) S 1 4242 4242 34816 4242 4194304 120 0 0 0 7 3 2 1 20 \
                    0 1 0 5000 1000000 200 18446744073709551615 1 1 0 0 0 0 0 0 0 0 0 0 17 3";
        assert_eq!(stat_jiffies(line), Some(13));
        assert_eq!(stat_jiffies("4242 (cut) S 1 2 3"), None);
        assert_eq!(stat_jiffies("no parens at all"), None);

        assert!(process_jiffies(unistd::getpid().as_raw()).is_some());
        assert_eq!(process_jiffies(0), None);
        assert!(clock_ticks() > 0);
    }

    #[test]
    fn nonblocking_round_trip() {
        let (read, write) = unistd::pipe().unwrap();
        set_nonblocking(read, true).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(read, FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
        set_nonblocking(read, false).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(read, FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
        unistd::close(read).unwrap();
        unistd::close(write).unwrap();
    }
}
