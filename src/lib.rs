#[macro_use]
pub mod error;

pub mod aarch64;
pub mod cmd;
pub mod event;
pub mod hooks;
pub mod regs;
pub mod sysno;
pub mod tracee;
pub mod tracer;
pub mod x86;

mod inject;
mod memory;
mod sys;

pub use nix::sys::ptrace::Options;
pub use nix::unistd::Pid;

pub use cmd::Command;
pub use error::{Error, ErrorKind, Result};
pub use event::{ProcessEvent, WaitTarget};
pub use hooks::{
    ExitAction, ExitStopAction, GroupStopAction, Hooks, InterruptAction, SignalAction,
    SysCallEntryAction, SysCallExitAction, SysCallInfo,
};
pub use regs::{Abi, Registers};
pub use tracee::{ExecMode, SysCallStatus, Tracee, TraceeState, REQUIRED_OPTIONS};
pub use tracer::{Tracer, DEFAULT_OPTIONS};
