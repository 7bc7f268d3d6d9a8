//! A single traced thread and its ptrace state machine.

use std::fmt;
use std::marker::PhantomData;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options, RequestType};
use nix::sys::signal::{self, Signal};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result, ResultExt};
use crate::event::{self, ProcessEvent, WaitTarget};
use crate::regs::Registers;
use crate::sys;
use crate::sysno;
use crate::Pid;

/// Options every seized tracee gets, whatever the caller asks for.
pub const REQUIRED_OPTIONS: Options = Options::PTRACE_O_TRACESYSGOOD
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEEXIT)
    .union(Options::PTRACE_O_TRACECLONE)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK);

/// Options the tracer has no events for, and which are never set.
pub const UNSUPPORTED_OPTIONS: Options =
    Options::PTRACE_O_TRACEVFORKDONE.union(Options::PTRACE_O_TRACESECCOMP);

/// The options actually set when seizing with `options`.
pub fn effective_options(options: Options) -> Options {
    (options | REQUIRED_OPTIONS) - UNSUPPORTED_OPTIONS
}

/// Tracing state of a thread, from the tracer's point of view.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceeState {
    /// Not attached.
    Detached,

    /// Resumed, and not known to have stopped yet.
    Executing,

    PreSysCallStop,
    PostSysCallStop,
    SignalStop,
    GroupStop,
    InterruptStop,
    NewProcessStop,
    ExecveStop,
    ExitStop,

    /// The thread no longer exists.
    Exited,
}

impl TraceeState {
    /// True in every ptrace-stop, where the tracee can be inspected and resumed.
    pub fn is_stopped(self) -> bool {
        !matches!(
            self,
            TraceeState::Detached | TraceeState::Executing | TraceeState::Exited
        )
    }

    pub fn is_syscall_stop(self) -> bool {
        matches!(self, TraceeState::PreSysCallStop | TraceeState::PostSysCallStop)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TraceeState::Detached | TraceeState::Exited)
    }
}

/// Whether the tracee is running its own code, or inside a syscall.
///
/// Syscall entry and exit stops look the same to `wait(2)`. They alternate strictly, so the
/// mode the tracee was resumed in tells them apart.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecMode {
    User,
    Kernel,
}

/// Provenance of the syscall at the current syscall stop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SysCallStatus {
    /// Issued by the tracee.
    Normal,

    /// Issued by the tracer.
    Injected,

    /// A tracee syscall restarted after an injection displaced it.
    Repeated,
}

/// Register state to restore once an asynchronous injection completes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct InjectionBackup {
    pub(crate) regs: Registers,

    /// `User` if the injection was issued at a syscall entry, `Kernel` at an exit.
    pub(crate) exec_mode: ExecMode,

    /// True until the tracee is first resumed after issuing the injection.
    pub(crate) at_origin: bool,
}

/// A syscall rewritten at entry, to be patched back at exit.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Suppression {
    pub(crate) original: i64,
    pub(crate) return_value: u64,
}

/// A traced thread.
pub struct Tracee {
    pub(crate) tid: Pid,
    pub(crate) tgid: Option<Pid>,
    pub(crate) state: TraceeState,
    pub(crate) exec_mode: ExecMode,
    pub(crate) syscall_status: SysCallStatus,

    // Valid at syscall stops only.
    pub(crate) regs: Option<Registers>,

    // Signal of the current signal-delivery, group or interrupt stop.
    pub(crate) stop_signal: i32,

    pub(crate) injection: Option<InjectionBackup>,
    pub(crate) suppression: Option<Suppression>,

    // Name of an exec syscall entered on an ABI whose kernel forgets the syscall number.
    pub(crate) exec_syscall: Option<&'static str>,

    // A `PTRACE_INTERRUPT` was issued and its stop not yet seen.
    pub(crate) interrupting: bool,

    // A terminal event consumed while waiting on this tracee alone.
    pub(crate) parked: Option<ProcessEvent>,

    // Signals held back during a synchronous injection, to be re-raised after it.
    pub(crate) deferred_signals: Vec<i32>,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for Tracee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracee")
            .field("tid", &self.tid)
            .field("tgid", &self.tgid)
            .field("state", &self.state)
            .field("exec_mode", &self.exec_mode)
            .field("syscall_status", &self.syscall_status)
            .finish()
    }
}

impl Tracee {
    /// A detached tracee for `tid`. Its thread group is looked up when seized, if unknown.
    pub fn new(tid: Pid, tgid: impl Into<Option<Pid>>) -> Self {
        Self {
            tid,
            tgid: tgid.into(),
            state: TraceeState::Detached,
            exec_mode: ExecMode::User,
            syscall_status: SysCallStatus::Normal,
            regs: None,
            stop_signal: 0,
            injection: None,
            suppression: None,
            exec_syscall: None,
            interrupting: false,
            parked: None,
            deferred_signals: vec![],
            _not_send: PhantomData,
        }
    }

    /// A thread the kernel attached for us, when its parent was traced.
    pub(crate) fn adopted(tid: Pid, tgid: Pid) -> Self {
        let mut tracee = Self::new(tid, tgid);
        tracee.state = TraceeState::Executing;
        tracee
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    /// Thread group id. Before the first seize, this may be the thread's own id.
    pub fn tgid(&self) -> Pid {
        self.tgid.unwrap_or(self.tid)
    }

    pub fn state(&self) -> TraceeState {
        self.state
    }

    pub fn exec_mode(&self) -> ExecMode {
        self.exec_mode
    }

    pub fn syscall_status(&self) -> SysCallStatus {
        self.syscall_status
    }

    /// Signal of the current signal-delivery, group or interrupt stop.
    pub fn stop_signal(&self) -> Option<i32> {
        match self.state {
            TraceeState::SignalStop | TraceeState::GroupStop | TraceeState::InterruptStop => {
                Some(self.stop_signal)
            }
            _ => None,
        }
    }

    /// Registers at the current syscall stop.
    pub fn registers(&self) -> Result<&Registers> {
        match (&self.regs, self.state.is_syscall_stop()) {
            (Some(regs), true) => Ok(regs),
            _ => Err(self.invalid_state("read registers")),
        }
    }

    /// Overwrite the registers at the current syscall stop.
    pub fn set_registers(&mut self, regs: Registers) -> Result<()> {
        if !self.state.is_syscall_stop() {
            return Err(self.invalid_state("write registers"));
        }

        self.write_registers(regs)
    }

    pub(crate) fn write_registers(&mut self, regs: Registers) -> Result<()> {
        regs.write(self.tid)?;
        self.regs = Some(regs);

        Ok(())
    }

    pub(crate) fn invalid_state(&self, op: &'static str) -> Error {
        Error::InvalidState {
            tid: self.tid,
            state: self.state,
            op,
        }
    }

    pub(crate) fn died(&self, source: Errno) -> Error {
        Error::TraceeDied {
            pid: self.tid,
            source,
        }
    }

    /// Begin tracing with `PTRACE_SEIZE`. The tracee keeps running.
    pub fn seize(&mut self, options: Options) -> Result<()> {
        if self.state != TraceeState::Detached {
            return Err(self.invalid_state("seize"));
        }

        let options = effective_options(options);
        ptrace::seize(self.tid, options).died_if_esrch(self.tid)?;

        if self.tgid.is_none() {
            match sys::thread_group_id(self.tid) {
                Ok(tgid) => self.tgid = Some(tgid),
                Err(err) => {
                    if let Err(errno) = ptrace::detach(self.tid, None) {
                        warn!(tid = self.tid.as_raw(), %errno, "unable to detach after failed seize");
                    }

                    return Err(err);
                }
            }
        }

        self.state = TraceeState::Executing;
        self.exec_mode = ExecMode::User;
        self.syscall_status = SysCallStatus::Normal;

        info!(tid = self.tid.as_raw(), tgid = self.tgid().as_raw(), ?options, "seized tracee");

        Ok(())
    }

    /// Ask an executing tracee to stop with `PTRACE_INTERRUPT`.
    ///
    /// Does nothing if the tracee is already stopped, or an interrupt is pending.
    pub fn interrupt(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid_state("interrupt"));
        }

        if self.state != TraceeState::Executing || self.interrupting {
            return Ok(());
        }

        ptrace::interrupt(self.tid).died_if_esrch(self.tid)?;
        self.interrupting = true;

        debug!(tid = self.tid.as_raw(), "interrupted tracee");

        Ok(())
    }

    /// Resume a stopped tracee until its next syscall stop, delivering the raw `signal`.
    ///
    /// Pass `0` to deliver no signal. If the tracee is leaving the exit stop of an
    /// asynchronously injected syscall, its original registers are restored first.
    pub fn continue_exec(&mut self, signal: i32) -> Result<()> {
        if !self.state.is_stopped() {
            return Err(self.invalid_state("continue"));
        }

        if self.completing_injection() {
            self.finish_injection()?;
        }

        self.resume(libc::PTRACE_SYSCALL as RequestType, signal)
    }

    /// Resume a group-stopped tracee with `PTRACE_LISTEN`.
    ///
    /// The tracee stays stopped, but will report a new stop once the group-stop ends.
    pub fn continue_stopped(&mut self) -> Result<()> {
        if !self.state.is_stopped() {
            return Err(self.invalid_state("listen"));
        }

        sys::restart(PTRACE_LISTEN, self.tid, 0)?;
        self.mark_resumed();

        Ok(())
    }

    // Restart the tracee with `request`, and track the resulting execution mode.
    pub(crate) fn resume(&mut self, request: RequestType, signal: i32) -> Result<()> {
        trace!(tid = self.tid.as_raw(), state = ?self.state, signal, "resuming tracee");

        sys::restart(request, self.tid, signal)?;

        match self.state {
            TraceeState::PreSysCallStop => {
                self.exec_mode = ExecMode::Kernel;

                if self.syscall_status == SysCallStatus::Repeated {
                    self.syscall_status = SysCallStatus::Normal;
                }
            }
            TraceeState::PostSysCallStop => {
                self.exec_mode = ExecMode::User;
            }
            _ => {}
        }

        self.mark_resumed();

        Ok(())
    }

    fn mark_resumed(&mut self) {
        if let Some(injection) = &mut self.injection {
            injection.at_origin = false;
        }

        self.state = TraceeState::Executing;
        self.regs = None;
        self.stop_signal = 0;
    }

    /// Stop tracing. The thread keeps running.
    ///
    /// An executing tracee is interrupted first. If it exits before stopping, its terminal
    /// event is parked on the tracee, and a `TraceeDied` error is returned.
    pub fn detach(&mut self) -> Result<()> {
        match self.state {
            TraceeState::Detached | TraceeState::Exited => {
                return Err(self.invalid_state("detach"));
            }
            TraceeState::Executing => self.stop_for_detach()?,
            _ => {}
        }

        if self.injection.is_some() {
            self.abandon_injection()?;
        }

        if let Some(suppression) = self.suppression.take() {
            // At entry, the substitute syscall has not run yet. Put the original back.
            let mut regs = *self.registers()?;
            regs.set_ptrace_syscall(suppression.original);
            self.write_registers(regs)?;
        }

        let signal = match self.state {
            TraceeState::SignalStop => self.stop_signal,
            _ => 0,
        };

        sys::restart(libc::PTRACE_DETACH as RequestType, self.tid, signal)?;

        self.state = TraceeState::Detached;
        self.regs = None;
        self.interrupting = false;
        self.exec_syscall = None;

        info!(tid = self.tid.as_raw(), signal, "detached tracee");

        Ok(())
    }

    // Bring an executing tracee to a ptrace-stop.
    fn stop_for_detach(&mut self) -> Result<()> {
        // Probe first, so a thread that is already gone is not waited on.
        if let Err(errno) = sys::tgkill(self.tgid(), self.tid, 0) {
            if errno == Errno::ESRCH {
                self.mark_exited();
            }

            return Err(Error::for_tracee(self.tid, errno));
        }

        if !self.interrupting {
            ptrace::interrupt(self.tid).died_if_esrch(self.tid)?;
            self.interrupting = true;
        }

        loop {
            let event = event::wait(WaitTarget::Tid(self.tid))?;

            match event {
                ProcessEvent::Retry => continue,
                ProcessEvent::NoChildren => {
                    self.mark_exited();
                    return Err(self.died(Errno::ECHILD));
                }
                event if event.is_terminal() => {
                    self.observe(&event);
                    self.parked = Some(event);
                    return Err(self.died(Errno::ESRCH));
                }
                event => {
                    self.observe(&event);
                    debug!(tid = self.tid.as_raw(), state = ?self.state, "stopped tracee for detach");
                    return Ok(());
                }
            }
        }
    }

    /// Kill the tracee's thread group with `SIGKILL`.
    ///
    /// The tracee leaves any stop and is treated as executing until its death is reported.
    pub fn kill(&mut self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(self.invalid_state("kill"));
        }

        signal::kill(self.tgid(), Signal::SIGKILL).died_if_esrch(self.tid)?;

        info!(tid = self.tid.as_raw(), tgid = self.tgid().as_raw(), "killed tracee");

        self.injection = None;
        self.suppression = None;
        self.mark_resumed();

        Ok(())
    }

    /// Rewrite the arguments of the syscall at the current entry stop.
    pub fn modify_syscall_args(&mut self, args: [u64; 6]) -> Result<()> {
        if self.state != TraceeState::PreSysCallStop {
            return Err(self.invalid_state("modify syscall arguments"));
        }

        let mut regs = *self.registers()?;
        regs.set_args(args);

        self.write_registers(regs)
    }

    /// Rewrite the return value of the syscall at the current exit stop.
    pub fn modify_syscall_ret(&mut self, value: u64) -> Result<()> {
        if self.state != TraceeState::PostSysCallStop {
            return Err(self.invalid_state("modify syscall return value"));
        }

        let mut regs = *self.registers()?;
        regs.set_return_value(value);

        self.write_registers(regs)
    }

    /// Bookkeeping due at every syscall entry stop, before the stop is reported.
    pub fn syscall_entry_pre_hook(&mut self) -> Result<()> {
        if self.state != TraceeState::PreSysCallStop {
            return Err(self.invalid_state("run the syscall entry hook"));
        }

        let regs = self.registers()?;
        let abi = regs.abi();

        self.exec_syscall = None;

        if abi.clears_syscall_on_exec() && sysno::is_exec(abi, regs.ptrace_syscall()) {
            self.exec_syscall = sysno::name(abi, regs.ptrace_syscall());
        }

        Ok(())
    }

    /// Bookkeeping due at every syscall exit stop, before the stop is reported.
    ///
    /// Completes a suppression begun at entry, and reports the exec syscall number on ABIs
    /// where the kernel forgets it.
    pub fn syscall_exit_pre_hook(&mut self) -> Result<()> {
        if self.state != TraceeState::PostSysCallStop {
            return Err(self.invalid_state("run the syscall exit hook"));
        }

        if let Some(name) = self.exec_syscall.take() {
            let mut regs = *self.registers()?;

            // After an exec, the ABI may differ from the one the syscall was entered with.
            if let Some(nr) = sysno::number(regs.abi(), name) {
                if regs.ptrace_syscall() != nr {
                    trace!(tid = self.tid.as_raw(), name, "restoring forgotten exec syscall number");
                    regs.set_ptrace_syscall(nr);
                    self.regs = Some(regs);
                }
            }
        }

        if let Some(suppression) = self.suppression.take() {
            let mut regs = *self.registers()?;
            regs.set_ptrace_syscall(suppression.original);
            regs.set_return_value(suppression.return_value);

            self.write_registers(regs)?;

            debug!(
                tid = self.tid.as_raw(),
                nr = suppression.original,
                ret = suppression.return_value,
                "completed syscall suppression"
            );
        }

        Ok(())
    }

    /// Update tracking state for an event reported for this tracee.
    pub(crate) fn observe(&mut self, event: &ProcessEvent) {
        let (state, signal) = match *event {
            ProcessEvent::SyscallStop { regs, .. } => {
                self.regs = Some(regs);

                let state = match self.exec_mode {
                    ExecMode::User => TraceeState::PreSysCallStop,
                    ExecMode::Kernel => TraceeState::PostSysCallStop,
                };

                (state, 0)
            }
            ProcessEvent::SignalDeliveryStop { signal, .. } => (TraceeState::SignalStop, signal),
            ProcessEvent::GroupStop { signal, .. } => (TraceeState::GroupStop, signal),
            ProcessEvent::InterruptStop { signal, .. } => {
                self.interrupting = false;
                (TraceeState::InterruptStop, signal)
            }
            ProcessEvent::NewProcessStop { .. } => (TraceeState::NewProcessStop, 0),
            ProcessEvent::ExecveStop { .. } => (TraceeState::ExecveStop, 0),
            ProcessEvent::ExitStop { .. } => (TraceeState::ExitStop, 0),
            ProcessEvent::ProcessExit { .. } | ProcessEvent::ProcessDeath { .. } => {
                self.mark_exited();
                return;
            }
            ProcessEvent::NoChildren | ProcessEvent::Retry => return,
        };

        trace!(tid = self.tid.as_raw(), ?state, "tracee stopped");

        self.state = state;
        self.stop_signal = signal;
    }

    pub(crate) fn mark_exited(&mut self) {
        self.state = TraceeState::Exited;
        self.regs = None;
        self.injection = None;
        self.suppression = None;
        self.interrupting = false;
    }

    /// Follow the thread id change of an exec from a non-leader thread.
    pub(crate) fn set_tid(&mut self, tid: Pid) {
        self.tid = tid;
    }

    pub(crate) fn take_parked(&mut self) -> Option<ProcessEvent> {
        self.parked.take()
    }
}

/// Defined in `include/uapi/linux/ptrace.h`.
const PTRACE_LISTEN: RequestType = 0x4208;
