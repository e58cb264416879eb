//! Job control for an interactive shell: launching pipelines into process groups, handing
//! the terminal back and forth, reaping children, and reporting what happened to them.

#[macro_use]
extern crate bitflags;
extern crate jobsh_sys as sys;

pub mod builtins;
pub mod shell;

pub use crate::shell::{
    io::{Io, IoChain},
    reaper::{ReapStrategy, Reaper},
    status::{ProcStatus, Status},
    terminal::{Terminal, Tty},
    Event, Job, JobControlMode, JobFlags, JobState, Options, PipelineError, Process, Shell,
    ShellBuilder,
};

pub fn version() -> &'static str { include!(concat!(env!("OUT_DIR"), "/version_string")) }
