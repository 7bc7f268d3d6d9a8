//! Callbacks through which a tracer client observes and steers its tracees.
//!
//! Each stop is reported to one hook, which answers with an action for the tracer to
//! apply. Hooks may also operate on the tracee directly, for example to inject syscalls or
//! access memory, before returning.

use crate::regs::{Abi, Registers};
use crate::sysno;
use crate::tracee::{SysCallStatus, Tracee};
use crate::tracer::Tracer;
use crate::Pid;

/// A syscall at an entry or exit stop, as seen by hooks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SysCallInfo {
    pub abi: Abi,
    pub number: i64,
    pub name: Option<&'static str>,
    pub args: [u64; 6],

    /// Raw return value, at exit stops only.
    pub return_value: Option<u64>,

    pub status: SysCallStatus,
}

impl SysCallInfo {
    pub(crate) fn entry(regs: &Registers, status: SysCallStatus) -> Self {
        let abi = regs.abi();
        let number = regs.ptrace_syscall();

        Self {
            abi,
            number,
            name: sysno::name(abi, number),
            args: regs.args(),
            return_value: None,
            status,
        }
    }

    pub(crate) fn exit(regs: &Registers, status: SysCallStatus) -> Self {
        Self {
            return_value: Some(regs.return_value()),
            ..Self::entry(regs, status)
        }
    }

    /// True if this is the syscall named `name`.
    pub fn is(&self, name: &str) -> bool {
        self.name == Some(name)
    }

    /// The decoded return value, at exit stops only.
    pub fn result(&self) -> Option<std::result::Result<u64, nix::errno::Errno>> {
        self.return_value.map(|value| self.abi.decode_return(value))
    }
}

/// What to do with a thread that has exited or been killed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitAction {
    /// Forget the tracee.
    Remove,

    /// Report the same event again on the next iteration of the event loop.
    Requeue,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SysCallEntryAction {
    Continue,

    /// Skip the syscall, and make it return the given raw value.
    Suppress(u64),

    Detach,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SysCallExitAction {
    Continue,
    Detach,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalAction {
    /// Deliver the signal.
    Forward,

    /// Discard the signal.
    Suppress,

    Detach,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupStopAction {
    /// Let the tracee stay stopped, with `PTRACE_LISTEN`, until the group-stop ends.
    Acknowledge,

    /// Resume the tracee despite the group-stop.
    Continue,

    Detach,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InterruptAction {
    Continue,
    Detach,
    Kill,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStopAction {
    Continue,
    Detach,
    Kill,
}

/// Receives the events of a [`Tracer`] run.
///
/// Every method has a default that lets the tracees run undisturbed.
#[allow(unused_variables)]
pub trait Hooks {
    /// A tracee was adopted: a new child or thread, or a thread group leader replaced by
    /// an exec from another thread.
    fn tracee_created(&mut self, tracer: &mut Tracer, tracee: &mut Tracee) {}

    /// A thread vanished without reporting its exit, because it exec'd and took over the
    /// thread id of its thread group leader.
    fn tracee_disappeared(&mut self, tracer: &mut Tracer, tid: Pid) {}

    fn process_exited(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        ExitAction::Remove
    }

    fn process_killed(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
        core_dumped: bool,
    ) -> ExitAction {
        ExitAction::Remove
    }

    fn syscall_entry(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallExitAction {
        SysCallExitAction::Continue
    }

    fn signal_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        SignalAction::Forward
    }

    fn group_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> GroupStopAction {
        GroupStopAction::Acknowledge
    }

    fn interrupt_stop(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
    ) -> InterruptAction {
        InterruptAction::Continue
    }

    /// The tracee is about to exit with wait status `status`.
    fn exit_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, status: i32) -> ExitStopAction {
        ExitStopAction::Continue
    }
}
