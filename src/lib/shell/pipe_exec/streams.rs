use super::super::io::{Io, IoChain};
use nix::{
    errno::Errno,
    fcntl::{self, OFlag},
    sys::stat::Mode,
    unistd,
};
use std::os::unix::io::RawFd;

/// Applies every redirection of `chain` to the calling process, in order, so that the last
/// one naming a descriptor wins. Only async-signal-safe calls are made, which makes this safe
/// to run between fork and exec. On failure, the descriptor that could not be set up is
/// returned along with the reason.
pub(super) fn apply(chain: &IoChain) -> Result<(), (RawFd, Errno)> {
    for io in chain.iter() {
        apply_one(io).map_err(|why| (io.fd(), why))?;
    }
    Ok(())
}

fn apply_one(io: &Io) -> nix::Result<()> {
    match io {
        Io::Close(fd) => match unistd::close(*fd) {
            // Closing what is already closed leaves the child in the state it asked for.
            Ok(()) | Err(Errno::EBADF) => Ok(()),
            Err(why) => Err(why),
        },
        Io::Fd(redirect) => sys::redirect(redirect.source, redirect.fd),
        Io::Pipe(redirect) => sys::redirect(redirect.pipe_fd, redirect.fd),
        Io::Buffer(buffer) => match buffer.write_fd() {
            Some(write) => sys::redirect(write, buffer.fd),
            None => Err(Errno::EBADF),
        },
        Io::File(redirect) => {
            let file = fcntl::open(
                redirect.path.as_c_str(),
                redirect.flags,
                Mode::from_bits_truncate(0o666),
            )?;
            if file != redirect.fd {
                let result = sys::redirect(file, redirect.fd);
                let _ = unistd::close(file);
                result?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{super::super::io::Io, *};
    use serial_test_derive::serial;
    use std::{fs, io::Write, os::unix::io::FromRawFd};

    #[test]
    #[serial]
    fn later_redirections_win() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let flags = OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC;

        let mut chain = IoChain::new();
        chain.push(Io::file(20, &first, flags).unwrap());
        chain.push(Io::file(20, &second, flags).unwrap());
        apply(&chain).unwrap();

        let mut file = unsafe { fs::File::from_raw_fd(20) };
        file.write_all(b"hello").unwrap();
        drop(file);

        assert_eq!(fs::read(&first).unwrap(), b"");
        assert_eq!(fs::read(&second).unwrap(), b"hello");
    }

    #[test]
    #[serial]
    fn closing_a_closed_descriptor_is_not_an_error() {
        let mut chain = IoChain::new();
        chain.push(Io::Close(250));
        assert!(apply(&chain).is_ok());
    }
}
