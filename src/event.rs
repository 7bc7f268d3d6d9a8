//! Translation of raw `wait(2)` statuses into tracer-level events.

use nix::errno::Errno;
use nix::sys::ptrace;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::regs::Registers;
use crate::Pid;

/// A wait status, decoded into a tracer-level event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessEvent {
    /// No traced children remain to wait on.
    NoChildren,

    /// The wait was interrupted, or the event vanished while being decoded. Wait again.
    Retry,

    /// The thread exited normally with exit code `code`.
    ProcessExit { tid: Pid, code: i32 },

    /// The thread was terminated by `signal`.
    ProcessDeath { tid: Pid, signal: i32, core_dumped: bool },

    /// Syscall entry or exit. The event cannot tell which, the tracee's execution mode does.
    SyscallStop { tid: Pid, regs: Registers },

    /// About to deliver `signal`.
    SignalDeliveryStop { tid: Pid, signal: i32 },

    /// Stopped by a stopping `signal` affecting the whole thread group.
    GroupStop { tid: Pid, signal: i32 },

    /// A `PTRACE_EVENT_STOP` that is not a group-stop.
    ///
    /// This covers `PTRACE_INTERRUPT`, the initial stop of auto-attached children, and
    /// re-traps after `SIGCONT`. Stopping-signal interrupt stops are indistinguishable from
    /// group-stops, and are reported as the latter.
    InterruptStop { tid: Pid, signal: i32 },

    /// `tid` created `new_tid` by `fork()`, `vfork()` or `clone()`.
    NewProcessStop { tid: Pid, new_tid: Pid },

    /// A successful `execve()`. `orig_tid` is the thread that called it, `tid` the thread
    /// group leader it has become.
    ExecveStop { tid: Pid, orig_tid: Pid },

    /// The thread is about to exit, with wait status `status`.
    ExitStop { tid: Pid, status: i32 },
}

impl ProcessEvent {
    /// The thread this event is about, if any.
    pub fn tid(&self) -> Option<Pid> {
        use ProcessEvent::*;

        match *self {
            NoChildren | Retry => None,
            ProcessExit { tid, .. }
            | ProcessDeath { tid, .. }
            | SyscallStop { tid, .. }
            | SignalDeliveryStop { tid, .. }
            | GroupStop { tid, .. }
            | InterruptStop { tid, .. }
            | NewProcessStop { tid, .. }
            | ExecveStop { tid, .. }
            | ExitStop { tid, .. } => Some(tid),
        }
    }

    /// True if the thread no longer exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessEvent::ProcessExit { .. } | ProcessEvent::ProcessDeath { .. })
    }
}

/// Which children to wait for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitTarget {
    /// A single thread.
    Tid(Pid),

    /// Any child in process group `pgid`.
    ProcessGroup(Pid),

    /// Any child in the caller's process group.
    SameProcessGroup,

    /// Any child.
    Any,
}

impl WaitTarget {
    fn as_raw(self) -> libc::pid_t {
        match self {
            WaitTarget::Tid(tid) => tid.as_raw(),
            WaitTarget::ProcessGroup(pgid) => -pgid.as_raw(),
            WaitTarget::SameProcessGroup => 0,
            WaitTarget::Any => -1,
        }
    }
}

/// Block until a child matching `target` changes state, and translate the change.
///
/// Only children of the calling thread are considered, so independent tracers may run on
/// separate threads of one process.
pub fn wait(target: WaitTarget) -> Result<ProcessEvent> {
    let mut status: libc::c_int = 0;

    // SAFETY: `status` is a valid, writable `int`.
    let res = unsafe {
        libc::waitpid(target.as_raw(), &mut status, libc::__WALL | libc::__WNOTHREAD)
    };

    match Errno::result(res) {
        Ok(pid) => translate(Pid::from_raw(pid), status),
        Err(Errno::EINTR) => Ok(ProcessEvent::Retry),
        Err(Errno::ECHILD) => Ok(ProcessEvent::NoChildren),
        Err(errno) => Err(errno.into()),
    }
}

/// A `wait(2)` status, decoded without querying the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WaitKind {
    Exited { code: i32 },
    Signaled { signal: i32, core_dumped: bool },
    Syscall,
    Event { event: i32, signal: i32 },
    Stopped { signal: i32 },
    Continued,
}

/// Decode a raw `wait(2)` status.
///
/// The bit layout of a stop status is:
///
///   31             16 15               8 7                 0
///    +---------------+------------------+-------------------+
///    |  ptrace event |    stop signal   |        0x7f       |
///    +---------------+------------------+-------------------+
///
/// With `PTRACE_O_TRACESYSGOOD`, syscall stops report `SIGTRAP | 0x80`.
pub(crate) fn decode(status: i32) -> Option<WaitKind> {
    let kind = if libc::WIFEXITED(status) {
        WaitKind::Exited { code: libc::WEXITSTATUS(status) }
    } else if libc::WIFSIGNALED(status) {
        WaitKind::Signaled {
            signal: libc::WTERMSIG(status),
            core_dumped: libc::WCOREDUMP(status),
        }
    } else if libc::WIFSTOPPED(status) {
        let signal = libc::WSTOPSIG(status);
        let event = status >> 16;

        if event != 0 {
            WaitKind::Event { event, signal }
        } else if signal == libc::SIGTRAP | 0x80 {
            WaitKind::Syscall
        } else {
            WaitKind::Stopped { signal }
        }
    } else if libc::WIFCONTINUED(status) {
        WaitKind::Continued
    } else {
        return None;
    };

    Some(kind)
}

fn is_stopping_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU)
}

fn translate(tid: Pid, status: i32) -> Result<ProcessEvent> {
    let kind = match decode(status) {
        Some(kind) => kind,
        None => internal_error!(format!("undecodable wait status {:#x} for {}", status, tid)),
    };

    trace!(tid = tid.as_raw(), ?kind, "decoded wait status");

    // The tracee may be killed between the wait and the follow-up queries below. Its death
    // will be reported by a later wait, so report this event as spurious.
    match query(tid, kind) {
        Err(Error::TraceeDied { .. }) => {
            debug!(tid = tid.as_raw(), "tracee died while decoding stop");
            Ok(ProcessEvent::Retry)
        }
        result => result,
    }
}

fn query(tid: Pid, kind: WaitKind) -> Result<ProcessEvent> {
    let event = match kind {
        WaitKind::Exited { code } => ProcessEvent::ProcessExit { tid, code },
        WaitKind::Signaled { signal, core_dumped } => ProcessEvent::ProcessDeath {
            tid,
            signal,
            core_dumped,
        },
        WaitKind::Syscall => ProcessEvent::SyscallStop {
            tid,
            regs: Registers::read(tid)?,
        },
        WaitKind::Stopped { signal } => ProcessEvent::SignalDeliveryStop { tid, signal },
        WaitKind::Continued => {
            // Never reported for ptrace children without `WCONTINUED`.
            internal_error!(format!("unexpected continue status for {}", tid))
        }
        WaitKind::Event { event, signal } => match event {
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                let new_tid = event_message(tid)? as u32 as i32;

                ProcessEvent::NewProcessStop {
                    tid,
                    new_tid: Pid::from_raw(new_tid),
                }
            }
            libc::PTRACE_EVENT_EXEC => {
                // The former thread id of the execing thread. From the manual:
                //
                //     If the execing thread is not a thread group leader, the thread ID is
                //     reset to thread group leader's ID before this stop.
                //
                let orig_tid = event_message(tid)? as u32 as i32;

                ProcessEvent::ExecveStop {
                    tid,
                    orig_tid: Pid::from_raw(orig_tid),
                }
            }
            libc::PTRACE_EVENT_EXIT => {
                let status = event_message(tid)? as u32 as i32;

                ProcessEvent::ExitStop { tid, status }
            }
            libc::PTRACE_EVENT_STOP => {
                if is_stopping_signal(signal) {
                    ProcessEvent::GroupStop { tid, signal }
                } else {
                    ProcessEvent::InterruptStop { tid, signal }
                }
            }
            _ => internal_error!(format!("unexpected ptrace event {} for {}", event, tid)),
        },
    };

    Ok(event)
}

fn event_message(tid: Pid) -> Result<libc::c_long> {
    match ptrace::getevent(tid) {
        Ok(msg) => Ok(msg),
        Err(Errno::ESRCH) => Err(Error::TraceeDied { pid: tid, source: Errno::ESRCH }),
        Err(errno) => Err(errno.into()),
    }
}
