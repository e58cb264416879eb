//! Redirection descriptors and the chains they are collected into.
//!
//! A chain is resolved back to front: the last descriptor naming an fd is the one that takes
//! effect. Descriptors own the fds they were built around and close them when dropped, except
//! for the target fd they map onto, which belongs to the child's descriptor table.

use nix::{errno::Errno, fcntl::OFlag, unistd};
use smallvec::SmallVec;
use std::{
    ffi::CString,
    os::unix::{ffi::OsStrExt, io::RawFd},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Size of each read when draining a buffer.
const BUFFER_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum RedirectionError {
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] Errno),
    #[error("no free file descriptor for redirection: {0}")]
    Exhausted(#[source] Errno),
    #[error("failed to make buffer non-blocking: {0}")]
    NonBlocking(#[source] Errno),
    #[error("redirection path contains a NUL byte: {0}")]
    InvalidPath(PathBuf),
}

/// Makes `fd` a duplicate of `source`.
#[derive(Debug)]
pub struct FdRedirect {
    pub fd:            RawFd,
    pub source:        RawFd,
    pub user_supplied: bool,
    close_source:      bool,
}

impl FdRedirect {
    pub fn new(fd: RawFd, source: RawFd, user_supplied: bool, close_source: bool) -> Self {
        FdRedirect { fd, source, user_supplied, close_source }
    }
}

impl Drop for FdRedirect {
    fn drop(&mut self) {
        if self.close_source {
            let _ = unistd::close(self.source);
        }
    }
}

/// Opens `path` with `flags` onto `fd`. The path is held as a C string so that the forked
/// child can open it without allocating.
#[derive(Debug)]
pub struct FileRedirect {
    pub fd:    RawFd,
    pub path:  CString,
    pub flags: OFlag,
}

/// Maps `fd` onto one end of a pipe. The pipe end is always closed on drop.
#[derive(Debug)]
pub struct PipeRedirect {
    pub fd:      RawFd,
    pub pipe_fd: RawFd,
}

impl Drop for PipeRedirect {
    fn drop(&mut self) { let _ = unistd::close(self.pipe_fd); }
}

/// Captures everything written to `fd` by a job into memory, through a pipe whose read end
/// stays with the shell.
#[derive(Debug)]
pub struct IoBuffer {
    pub fd:   RawFd,
    read:     RawFd,
    write:    Option<RawFd>,
    contents: Vec<u8>,
}

impl IoBuffer {
    /// Creates a buffer redirection for `fd`. Neither end of the pipe will collide with a
    /// descriptor that `conflicts` already redirects.
    pub fn create(fd: RawFd, conflicts: &IoChain) -> Result<Self, RedirectionError> {
        Self::create_clear_of(fd, &|candidate| conflicts.claims(candidate))
    }

    /// As `create`, with the claimed descriptors described by a predicate.
    pub(crate) fn create_clear_of(
        fd: RawFd,
        claimed: &dyn Fn(RawFd) -> bool,
    ) -> Result<Self, RedirectionError> {
        let (read, write) = pipe_clear_of(claimed)?;
        if let Err(why) = sys::set_nonblocking(read, true) {
            let _ = unistd::close(read);
            let _ = unistd::close(write);
            return Err(RedirectionError::NonBlocking(why));
        }

        Ok(IoBuffer { fd, read, write: Some(write), contents: Vec::new() })
    }

    /// The end the shell reads from.
    pub fn read_fd(&self) -> RawFd { self.read }

    /// The end the job writes into, until it has been closed by `read_to_end`.
    pub fn write_fd(&self) -> Option<RawFd> { self.write }

    pub fn contents(&self) -> &[u8] { &self.contents }

    pub fn into_contents(mut self) -> Vec<u8> { std::mem::take(&mut self.contents) }

    /// Appends whatever is currently readable, without waiting for more. Returns the number
    /// of bytes appended.
    pub fn read_available(&mut self) -> usize {
        let mut chunk = [0u8; BUFFER_CHUNK];
        let mut total = 0;
        loop {
            match unistd::read(self.read, &mut chunk) {
                Ok(0) => break,
                Ok(read) => {
                    self.contents.extend_from_slice(&chunk[..read]);
                    total += read;
                }
                Err(Errno::EINTR) => continue,
                // The writer has exited by the time this is called; EAGAIN here is a broken
                // pipe resetting flags, not pending data.
                Err(Errno::EAGAIN) => break,
                Err(why) => {
                    log::warn!("read from buffer fd {} failed: {}", self.read, why);
                    break;
                }
            }
        }
        total
    }

    /// Closes the write end and drains the pipe into memory.
    pub fn read_to_end(&mut self) -> usize {
        if let Some(write) = self.write.take() {
            let _ = unistd::close(write);
        }
        self.read_available()
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        let _ = unistd::close(self.read);
        if let Some(write) = self.write.take() {
            let _ = unistd::close(write);
        }
    }
}

/// A single redirection.
#[derive(Debug)]
pub enum Io {
    Close(RawFd),
    Fd(FdRedirect),
    File(FileRedirect),
    Pipe(PipeRedirect),
    Buffer(IoBuffer),
}

impl Io {
    pub fn file<P: AsRef<Path>>(fd: RawFd, path: P, flags: OFlag) -> Result<Self, RedirectionError> {
        let path = path.as_ref();
        CString::new(path.as_os_str().as_bytes())
            .map(|path| Io::File(FileRedirect { fd, path, flags }))
            .map_err(|_| RedirectionError::InvalidPath(path.to_path_buf()))
    }

    pub fn duplicate(fd: RawFd, source: RawFd) -> Self {
        Io::Fd(FdRedirect::new(fd, source, true, false))
    }

    pub fn pipe(fd: RawFd, pipe_fd: RawFd) -> Self { Io::Pipe(PipeRedirect { fd, pipe_fd }) }

    /// The descriptor number in the child that this redirection affects.
    pub fn fd(&self) -> RawFd {
        match self {
            Io::Close(fd) => *fd,
            Io::Fd(redirect) => redirect.fd,
            Io::File(redirect) => redirect.fd,
            Io::Pipe(redirect) => redirect.fd,
            Io::Buffer(buffer) => buffer.fd,
        }
    }
}

/// An ordered list of redirections.
#[derive(Debug, Default)]
pub struct IoChain(Vec<Io>);

impl IoChain {
    pub fn new() -> Self { IoChain(Vec::new()) }

    pub fn push(&mut self, io: Io) { self.0.push(io); }

    pub fn prepend(&mut self, io: Io) { self.0.insert(0, io); }

    pub fn append(&mut self, other: IoChain) { self.0.extend(other.0); }

    pub fn remove(&mut self, index: usize) -> Option<Io> {
        if index < self.0.len() {
            Some(self.0.remove(index))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize { self.0.len() }

    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Io> { self.0.iter() }

    /// The redirection in effect for `fd`: the last one in the chain that names it.
    pub fn get_io_for_fd(&self, fd: RawFd) -> Option<&Io> { self.0.iter().rev().find(|io| io.fd() == fd) }

    pub fn claims(&self, fd: RawFd) -> bool { self.0.iter().any(|io| io.fd() == fd) }

    pub fn buffers(&self) -> impl Iterator<Item = &IoBuffer> {
        self.0.iter().filter_map(|io| match io {
            Io::Buffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    pub fn buffers_mut(&mut self) -> impl Iterator<Item = &mut IoBuffer> {
        self.0.iter_mut().filter_map(|io| match io {
            Io::Buffer(buffer) => Some(buffer),
            _ => None,
        })
    }

    /// Removes the buffer in effect for `fd` from the chain and hands it over.
    pub fn take_buffer(&mut self, fd: RawFd) -> Option<IoBuffer> {
        let index = self.0.iter().rposition(|io| matches!(io, Io::Buffer(b) if b.fd == fd))?;
        match self.0.remove(index) {
            Io::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }
}

/// Moves `fd` to a descriptor number that `chain` does not claim. Every fd the search moves
/// away from is closed, but only once the search is over, so that `dup` can never hand back a
/// number that was just released. The returned fd is close-on-exec. On failure, `fd` and all
/// intermediates are closed.
pub fn move_fd_to_unused(fd: RawFd, chain: &IoChain) -> nix::Result<RawFd> {
    move_fd_clear_of(fd, &|candidate| chain.claims(candidate))
}

fn move_fd_clear_of(fd: RawFd, claimed: &dyn Fn(RawFd) -> bool) -> nix::Result<RawFd> {
    let mut abandoned: SmallVec<[RawFd; 4]> = SmallVec::new();
    let mut current = fd;
    let result = loop {
        if !claimed(current) {
            break Ok(current);
        }

        abandoned.push(current);
        match sys::dup(current) {
            Ok(new_fd) => {
                if let Err(why) = sys::set_cloexec(new_fd) {
                    log::debug!("unable to set close-on-exec on fd {}: {}", new_fd, why);
                }
                current = new_fd;
            }
            Err(why) => break Err(why),
        }
    };

    for fd in abandoned {
        let _ = unistd::close(fd);
    }

    result
}

/// Ensures neither end of a fresh pipe is a descriptor claimed by `chain`. On failure both
/// candidate fds are closed.
pub fn pipe_avoid_conflicts_with_io_chain(
    read: RawFd,
    write: RawFd,
    chain: &IoChain,
) -> Result<(RawFd, RawFd), RedirectionError> {
    avoid_conflicts(read, write, &|candidate| chain.claims(candidate))
}

fn avoid_conflicts(
    read: RawFd,
    write: RawFd,
    claimed: &dyn Fn(RawFd) -> bool,
) -> Result<(RawFd, RawFd), RedirectionError> {
    let read = move_fd_clear_of(read, claimed);
    let write = move_fd_clear_of(write, claimed);
    match (read, write) {
        (Ok(read), Ok(write)) => Ok((read, write)),
        (Ok(fd), Err(why)) | (Err(why), Ok(fd)) => {
            let _ = unistd::close(fd);
            Err(RedirectionError::Exhausted(why))
        }
        (Err(why), Err(_)) => Err(RedirectionError::Exhausted(why)),
    }
}

fn cloexec_pipe() -> Result<(RawFd, RawFd), RedirectionError> {
    let (read, write) = unistd::pipe().map_err(RedirectionError::Pipe)?;
    for &fd in &[read, write] {
        if let Err(why) = sys::set_cloexec(fd) {
            let _ = unistd::close(read);
            let _ = unistd::close(write);
            return Err(RedirectionError::Pipe(why));
        }
    }
    Ok((read, write))
}

/// Creates a close-on-exec pipe whose ends stay clear of every fd `conflicts` claims.
pub fn pipe(conflicts: &IoChain) -> Result<(RawFd, RawFd), RedirectionError> {
    let (read, write) = cloexec_pipe()?;
    pipe_avoid_conflicts_with_io_chain(read, write, conflicts)
}

/// As `pipe`, with the claimed descriptors described by a predicate.
pub(crate) fn pipe_clear_of(
    claimed: &dyn Fn(RawFd) -> bool,
) -> Result<(RawFd, RawFd), RedirectionError> {
    let (read, write) = cloexec_pipe()?;
    avoid_conflicts(read, write, claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test_derive::serial;

    fn claiming(fds: &[RawFd]) -> IoChain {
        let mut chain = IoChain::new();
        for &fd in fds {
            chain.push(Io::Close(fd));
        }
        chain
    }

    /// The two descriptors the next `pipe()` call is going to hand out.
    fn next_pipe_fds() -> (RawFd, RawFd) {
        let (read, write) = unistd::pipe().unwrap();
        unistd::close(read).unwrap();
        unistd::close(write).unwrap();
        (read, write)
    }

    #[test]
    fn last_redirection_wins() {
        let mut chain = IoChain::new();
        chain.push(Io::Close(1));
        chain.push(Io::duplicate(2, 1));
        chain.push(Io::file(1, "/dev/null", OFlag::O_WRONLY).unwrap());

        match chain.get_io_for_fd(1) {
            Some(Io::File(redirect)) => assert_eq!(redirect.path.as_bytes(), b"/dev/null"),
            other => panic!("expected a file redirection, found {:?}", other),
        }
        assert!(matches!(chain.get_io_for_fd(2), Some(Io::Fd(_))));
        assert!(chain.get_io_for_fd(0).is_none());

        chain.prepend(Io::Close(0));
        assert!(matches!(chain.iter().next(), Some(Io::Close(0))));
        assert!(matches!(chain.remove(0), Some(Io::Close(0))));
        assert!(chain.remove(10).is_none());
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn file_path_with_nul_is_rejected() {
        assert!(matches!(
            Io::file(1, "bad\0path", OFlag::O_RDONLY),
            Err(RedirectionError::InvalidPath(_))
        ));
    }

    #[test]
    #[serial]
    fn unclaimed_fd_is_left_alone() {
        let (read, write) = unistd::pipe().unwrap();
        assert_eq!(move_fd_to_unused(read, &IoChain::new()).unwrap(), read);
        assert!(sys::is_open(read));
        unistd::close(read).unwrap();
        unistd::close(write).unwrap();
    }

    #[test]
    #[serial]
    fn claimed_fd_is_moved_and_closed() {
        let (read, write) = unistd::pipe().unwrap();
        let chain = claiming(&[read, read + 2, read + 3]);
        let moved = move_fd_to_unused(read, &chain).unwrap();
        assert!(!chain.claims(moved));
        assert!(sys::is_open(moved));
        assert!(!sys::is_open(read));
        unistd::close(moved).unwrap();
        unistd::close(write).unwrap();
    }

    #[test]
    #[serial]
    fn buffer_avoids_claimed_descriptors() {
        let (next_read, next_write) = next_pipe_fds();
        let existing = {
            let mut chain = claiming(&[next_read, next_write]);
            chain.push(Io::Fd(FdRedirect::new(1, 1, false, false)));
            chain.push(Io::Fd(FdRedirect::new(2, 2, false, false)));
            chain
        };

        let buffer = IoBuffer::create(1, &existing).unwrap();
        let read = buffer.read_fd();
        let write = buffer.write_fd().unwrap();
        assert_ne!(read, write);
        for &fd in &[1, 2, next_read, next_write] {
            assert_ne!(read, fd);
            assert_ne!(write, fd);
        }
        assert!(sys::is_open(1) && sys::is_open(2));

        drop(buffer);
        assert!(!sys::is_open(read));
        assert!(!sys::is_open(write));
    }

    #[test]
    #[serial]
    fn pipe_ends_skip_claimed_descriptors() {
        let (next_read, next_write) = next_pipe_fds();
        let chain = claiming(&[next_read, next_write, next_write + 1]);

        let (read, write) = pipe(&chain).unwrap();
        assert!(!chain.claims(read) && !chain.claims(write));
        assert!(!sys::is_open(next_read) && !sys::is_open(next_write));

        unistd::write(write, b"x").unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(unistd::read(read, &mut byte).unwrap(), 1);
        unistd::close(read).unwrap();
        unistd::close(write).unwrap();
    }

    #[test]
    #[serial]
    fn buffer_collects_output() {
        let mut buffer = IoBuffer::create(1, &IoChain::new()).unwrap();
        let write = buffer.write_fd().unwrap();
        unistd::write(write, b"hello ").unwrap();
        assert_eq!(buffer.read_available(), 6);
        unistd::write(write, b"world").unwrap();
        buffer.read_to_end();
        assert!(buffer.write_fd().is_none());
        assert!(!sys::is_open(write));
        assert_eq!(buffer.into_contents(), b"hello world".to_vec());
    }

    #[test]
    #[serial]
    fn pipe_redirect_closes_its_end() {
        let (read, write) = unistd::pipe().unwrap();
        let mut chain = IoChain::new();
        chain.push(Io::pipe(0, read));
        chain.push(Io::Fd(FdRedirect::new(1, write, false, true)));
        drop(chain);
        assert!(!sys::is_open(read));
        assert!(!sys::is_open(write));
    }

    #[test]
    #[serial]
    fn duplicate_does_not_close_source() {
        let (read, write) = unistd::pipe().unwrap();
        drop(Io::duplicate(5, read));
        assert!(sys::is_open(read));
        unistd::close(read).unwrap();
        unistd::close(write).unwrap();
    }

    #[test]
    #[serial]
    fn take_buffer_out_of_chain() {
        let mut chain = IoChain::new();
        chain.push(Io::Close(3));
        chain.push(Io::Buffer(IoBuffer::create(1, &IoChain::new()).unwrap()));
        assert_eq!(chain.buffers().count(), 1);
        let buffer = chain.take_buffer(1).unwrap();
        assert_eq!(buffer.fd, 1);
        assert_eq!(chain.len(), 1);
        assert!(chain.take_buffer(1).is_none());
    }
}
