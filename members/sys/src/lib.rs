//! Thin, platform-specific plumbing for the job-control core: wait-status decoding, signal
//! masks and descriptor flags. Everything above this crate speaks in `nix` types.

#[cfg(unix)]
#[path = "sys/unix/mod.rs"]
mod sys;

pub use self::sys::*;
