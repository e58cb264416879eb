//! Runs alone: it lowers the descriptor limit of the whole process.

use jobsh::{
    shell::io::{pipe_avoid_conflicts_with_io_chain, RedirectionError},
    Io, IoChain,
};
use nix::{
    fcntl::{fcntl, FcntlArg},
    libc, unistd,
};
use std::{fs, os::unix::io::RawFd};

fn open_fds() -> usize { fs::read_dir("/proc/self/fd").unwrap().count() }

fn is_open(fd: RawFd) -> bool { fcntl(fd, FcntlArg::F_GETFD).is_ok() }

#[test]
fn exhausted_descriptors_close_both_candidates() {
    let mut saved = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved) }, 0);

    let before = open_fds();
    let (read, write) = unistd::pipe().unwrap();

    // Every descriptor the process may still open is claimed, so no move can succeed.
    let ceiling = write + 8;
    let mut claims = IoChain::new();
    for fd in 0..ceiling {
        claims.push(Io::Close(fd));
    }
    let lowered = libc::rlimit { rlim_cur: ceiling as libc::rlim_t, rlim_max: saved.rlim_max };
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);

    let result = pipe_avoid_conflicts_with_io_chain(read, write, &claims);
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &saved) }, 0);

    assert!(matches!(result, Err(RedirectionError::Exhausted(_))), "{:?}", result);
    assert!(!is_open(read) && !is_open(write));
    assert_eq!(open_fds(), before);
}
