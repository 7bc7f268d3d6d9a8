//! The event loop driving a set of tracees.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::marker::PhantomData;

use nix::errno::Errno;
use nix::sys::ptrace::{Options, RequestType};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use tracing::{debug, info, trace, warn};

use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::event::{self, ProcessEvent, WaitTarget};
use crate::hooks::{
    ExitAction, ExitStopAction, GroupStopAction, Hooks, InterruptAction, SignalAction,
    SysCallEntryAction, SysCallExitAction, SysCallInfo,
};
use crate::sys;
use crate::tracee::{effective_options, Tracee, TraceeState, REQUIRED_OPTIONS};
use crate::Pid;

/// Options used when none are set explicitly.
pub const DEFAULT_OPTIONS: Options = REQUIRED_OPTIONS;

/// Traces a set of threads, and reports their events to [`Hooks`].
///
/// Processes started with [`Tracer::spawn`] are owned by the tracer. An owned process is
/// killed when its last tracee is removed, and when the tracer is dropped. Other tracees
/// are detached when the tracer is dropped.
///
/// Tracees can only be waited on from the thread that attached them, so a tracer is not
/// `Send`.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<systrace::Tracer>();
/// ```
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<systrace::Tracee>();
/// ```
pub struct Tracer {
    options: Options,

    // Tracees, by tid.
    tracees: BTreeMap<i32, Tracee>,

    // Thread group ids of spawned processes.
    owned: BTreeSet<i32>,

    // Children announced by a fork, vfork or clone stop, which have not stopped yet.
    pending: BTreeSet<i32>,

    // Events to report again before waiting for new ones.
    requeued: VecDeque<ProcessEvent>,

    stop_requested: bool,

    #[doc(hidden)]
    _not_send: PhantomData<*const ()>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            options: DEFAULT_OPTIONS,
            tracees: BTreeMap::new(),
            owned: BTreeSet::new(),
            pending: BTreeSet::new(),
            requeued: VecDeque::new(),
            stop_requested: false,
            _not_send: PhantomData,
        }
    }

    /// Return the ptrace options set on spawned and attached tracees.
    pub fn options(&self) -> Options {
        self.options
    }

    /// Set the ptrace options for tracees spawned or attached from now on.
    ///
    /// **NOTE:** [`REQUIRED_OPTIONS`] are always set, and options we have no events for
    /// are always cleared.
    pub fn set_options(&mut self, options: Options) {
        self.options = effective_options(options);
    }

    pub fn tracee(&self, tid: Pid) -> Option<&Tracee> {
        self.tracees.get(&tid.as_raw())
    }

    pub fn tracee_mut(&mut self, tid: Pid) -> Option<&mut Tracee> {
        self.tracees.get_mut(&tid.as_raw())
    }

    pub fn tracees(&self) -> impl Iterator<Item = &Tracee> {
        self.tracees.values()
    }

    pub fn is_empty(&self) -> bool {
        self.tracees.is_empty()
    }

    /// True if the thread group `tgid` was spawned by this tracer, and is still traced.
    pub fn owns(&self, tgid: Pid) -> bool {
        self.owned.contains(&tgid.as_raw())
    }

    /// Ask [`Tracer::run`] to return once the current event has been handled.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Start `cmd` as an owned tracee, returning its pid.
    ///
    /// The child stops itself before `execve()`, so the exec and everything after it is
    /// traced.
    pub fn spawn(&mut self, cmd: Command) -> Result<Pid> {
        let pid = cmd.fork_exec()?;

        loop {
            match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                Ok(status) => {
                    internal_error!(format!("unexpected status of spawned child: {:?}", status))
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }

        let mut tracee = Tracee::new(pid, pid);

        if let Err(err) = tracee.seize(self.options) {
            if let Err(errno) = signal::kill(pid, Signal::SIGKILL) {
                warn!(pid = pid.as_raw(), %errno, "unable to kill untraceable child");
            } else if let Err(errno) = waitpid(pid, None) {
                warn!(pid = pid.as_raw(), %errno, "unable to reap untraceable child");
            }

            return Err(err);
        }

        self.owned.insert(pid.as_raw());
        self.tracees.insert(pid.as_raw(), tracee);

        // Let the child proceed to its exec.
        signal::kill(pid, Signal::SIGCONT).died_if_esrch(pid)?;

        info!(pid = pid.as_raw(), "spawned tracee");

        Ok(pid)
    }

    /// Seize and interrupt the thread `tid`.
    pub fn attach(&mut self, tid: Pid) -> Result<()> {
        if self.tracees.contains_key(&tid.as_raw()) {
            return Err(Error::InvalidArgument(format!("{} is already traced", tid)));
        }

        let mut tracee = Tracee::new(tid, None);
        tracee.seize(self.options)?;

        let res = tracee.interrupt();

        self.pending.remove(&tid.as_raw());
        self.tracees.insert(tid.as_raw(), tracee);

        res
    }

    /// Attach to every thread of the process `pid`, returning the newly attached threads.
    pub fn attach_process(&mut self, pid: Pid) -> Result<Vec<Pid>> {
        let mut attached = vec![];

        // Threads created before their creator was seized are not attached automatically,
        // so rescan until no new threads turn up.
        loop {
            let mut found = false;

            for tid in sys::threads(pid)? {
                if self.tracees.contains_key(&tid.as_raw()) {
                    continue;
                }

                match self.attach(tid) {
                    Ok(()) => {
                        attached.push(tid);
                        found = true;
                    }
                    Err(err) if err.tracee_died() => {
                        debug!(tid = tid.as_raw(), "thread exited before attach");
                    }
                    Err(err) => return Err(err),
                }
            }

            if !found {
                break;
            }
        }

        info!(pid = pid.as_raw(), threads = attached.len(), "attached to process");

        Ok(attached)
    }

    /// Detach from `tid`, which keeps running.
    ///
    /// If `tid` belongs to an owned process, the tracer gives up ownership of it.
    pub fn detach(&mut self, tid: Pid) -> Result<()> {
        let mut tracee = self.take(tid)?;
        let res = tracee.detach();

        self.settle(tracee);

        res
    }

    /// Kill the process of `tid`. Its death is reported by a later event.
    pub fn kill(&mut self, tid: Pid) -> Result<()> {
        match self.tracees.get_mut(&tid.as_raw()) {
            Some(tracee) => tracee.kill(),
            None => Err(Error::InvalidArgument(format!("{} is not traced", tid))),
        }
    }

    /// Dispatch events to `hooks` until no tracees remain, or a stop is requested.
    pub fn run<H: Hooks + ?Sized>(&mut self, hooks: &mut H) -> Result<()> {
        self.stop_requested = false;

        loop {
            if self.stop_requested {
                debug!("stop requested");
                self.stop_requested = false;

                return Ok(());
            }

            let event = match self.requeued.pop_front() {
                Some(event) => event,
                None => {
                    if self.tracees.is_empty() && self.pending.is_empty() {
                        debug!("no tracees to wait on");

                        return Ok(());
                    }

                    event::wait(WaitTarget::Any)?
                }
            };

            trace!(?event, "dispatching event");

            match event {
                ProcessEvent::Retry => continue,
                ProcessEvent::NoChildren => {
                    debug!(tracees = self.tracees.len(), "no children left to wait on");
                    self.pending.clear();

                    return Ok(());
                }
                ProcessEvent::ProcessExit { .. } | ProcessEvent::ProcessDeath { .. } => {
                    self.on_exit(hooks, event)?
                }
                _ => self.on_stop(hooks, event)?,
            }
        }
    }

    fn on_exit<H: Hooks + ?Sized>(&mut self, hooks: &mut H, event: ProcessEvent) -> Result<()> {
        let tid = match event.tid() {
            Some(tid) => tid,
            None => internal_error!("exit event without a tid"),
        };

        self.pending.remove(&tid.as_raw());

        let mut tracee = match self.tracees.remove(&tid.as_raw()) {
            Some(tracee) => tracee,
            None => {
                debug!(tid = tid.as_raw(), ?event, "ignoring exit of untracked thread");
                return Ok(());
            }
        };

        tracee.observe(&event);

        let action = match event {
            ProcessEvent::ProcessExit { code, .. } => hooks.process_exited(self, &mut tracee, code),
            ProcessEvent::ProcessDeath {
                signal,
                core_dumped,
                ..
            } => hooks.process_killed(self, &mut tracee, signal, core_dumped),
            _ => internal_error!(format!("not an exit event: {:?}", event)),
        };

        match action {
            ExitAction::Remove => self.remove(tracee),
            ExitAction::Requeue => {
                self.requeued.push_back(event);
                self.tracees.insert(tid.as_raw(), tracee);

                Ok(())
            }
        }
    }

    fn on_stop<H: Hooks + ?Sized>(&mut self, hooks: &mut H, event: ProcessEvent) -> Result<()> {
        let tid = match event {
            ProcessEvent::ExecveStop { tid, orig_tid } if tid != orig_tid => {
                return self.on_exec_off_leader(hooks, event, tid, orig_tid);
            }
            event => match event.tid() {
                Some(tid) => tid,
                None => internal_error!("stop event without a tid"),
            },
        };

        let (mut tracee, adopted) = match self.tracees.remove(&tid.as_raw()) {
            Some(tracee) => (tracee, false),
            None => match self.adopt(tid) {
                Ok(tracee) => (tracee, true),
                Err(err) if err.tracee_died() => {
                    debug!(tid = tid.as_raw(), "untracked thread died before adoption");
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
        };

        tracee.observe(&event);

        if adopted {
            hooks.tracee_created(self, &mut tracee);
        }

        let res = if tracee.state().is_stopped() {
            self.handle_stop(hooks, &mut tracee, event)
        } else {
            Ok(())
        };

        self.settle(tracee);

        tolerate_death(res)
    }

    // A non-leader thread exec'd. The kernel reports the exec under the tid of the thread
    // group leader, which has vanished without reporting an exit of its own.
    fn on_exec_off_leader<H: Hooks + ?Sized>(
        &mut self,
        hooks: &mut H,
        event: ProcessEvent,
        tid: Pid,
        orig_tid: Pid,
    ) -> Result<()> {
        let leader_known = match self.tracees.remove(&tid.as_raw()) {
            Some(mut leader) => {
                debug!(tid = tid.as_raw(), "dropping thread group leader replaced by exec");
                leader.mark_exited();

                true
            }
            None => false,
        };

        self.pending.remove(&tid.as_raw());
        self.pending.remove(&orig_tid.as_raw());

        let mut tracee = match self.tracees.remove(&orig_tid.as_raw()) {
            Some(tracee) => tracee,
            None => match self.adopt(tid) {
                Ok(tracee) => tracee,
                Err(err) if err.tracee_died() => return Ok(()),
                Err(err) => return Err(err),
            },
        };

        info!(
            tid = tid.as_raw(),
            orig_tid = orig_tid.as_raw(),
            "thread exec'd off the thread group leader"
        );

        tracee.set_tid(tid);
        tracee.observe(&event);

        hooks.tracee_disappeared(self, orig_tid);

        if !leader_known {
            hooks.tracee_created(self, &mut tracee);
        }

        let res = if tracee.state() == TraceeState::ExecveStop {
            tracee.continue_exec(0)
        } else {
            Ok(())
        };

        self.settle(tracee);

        tolerate_death(res)
    }

    fn handle_stop<H: Hooks + ?Sized>(
        &mut self,
        hooks: &mut H,
        tracee: &mut Tracee,
        event: ProcessEvent,
    ) -> Result<()> {
        let state = tracee.state();

        match event {
            ProcessEvent::SyscallStop { .. } if state == TraceeState::PreSysCallStop => {
                tracee.syscall_entry_pre_hook()?;

                let info = SysCallInfo::entry(tracee.registers()?, tracee.syscall_status());
                let action = hooks.syscall_entry(self, tracee, &info);

                if still_in(tracee, state) {
                    match action {
                        SysCallEntryAction::Continue => tracee.continue_exec(0)?,
                        SysCallEntryAction::Suppress(value) => {
                            tracee.suppress_syscall(value)?;
                            tracee.continue_exec(0)?;
                        }
                        SysCallEntryAction::Detach => tracee.detach()?,
                        SysCallEntryAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::SyscallStop { .. } => {
                tracee.syscall_exit_pre_hook()?;

                let info = SysCallInfo::exit(tracee.registers()?, tracee.syscall_status());
                let action = hooks.syscall_exit(self, tracee, &info);

                if still_in(tracee, state) {
                    match action {
                        SysCallExitAction::Continue => tracee.continue_exec(0)?,
                        SysCallExitAction::Detach => tracee.detach()?,
                        SysCallExitAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::SignalDeliveryStop { signal, .. } => {
                let action = hooks.signal_stop(self, tracee, signal);

                if still_in(tracee, state) {
                    match action {
                        SignalAction::Forward => tracee.continue_exec(signal)?,
                        SignalAction::Suppress => tracee.continue_exec(0)?,
                        SignalAction::Detach => tracee.detach()?,
                        SignalAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::GroupStop { signal, .. } => {
                let action = hooks.group_stop(self, tracee, signal);

                if still_in(tracee, state) {
                    match action {
                        GroupStopAction::Acknowledge => tracee.continue_stopped()?,
                        GroupStopAction::Continue => tracee.continue_exec(0)?,
                        GroupStopAction::Detach => tracee.detach()?,
                        GroupStopAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::InterruptStop { signal, .. } => {
                let action = hooks.interrupt_stop(self, tracee, signal);

                if still_in(tracee, state) {
                    match action {
                        InterruptAction::Continue => tracee.continue_exec(0)?,
                        InterruptAction::Detach => tracee.detach()?,
                        InterruptAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::ExitStop { status, .. } => {
                let action = hooks.exit_stop(self, tracee, status);

                if still_in(tracee, state) {
                    match action {
                        ExitStopAction::Continue => tracee.continue_exec(0)?,
                        ExitStopAction::Detach => tracee.detach()?,
                        ExitStopAction::Kill => tracee.kill()?,
                    }
                }
            }
            ProcessEvent::NewProcessStop { new_tid, .. } => {
                // The child reports its own first stop later, possibly before this one.
                if !self.tracees.contains_key(&new_tid.as_raw()) {
                    trace!(tid = tracee.tid().as_raw(), new_tid = new_tid.as_raw(), "pending child");
                    self.pending.insert(new_tid.as_raw());
                }

                tracee.continue_exec(0)?;
            }
            ProcessEvent::ExecveStop { .. } => {
                tracee.continue_exec(0)?;
            }
            _ => internal_error!(format!("not a stop event: {:?}", event)),
        }

        Ok(())
    }

    fn adopt(&mut self, tid: Pid) -> Result<Tracee> {
        self.pending.remove(&tid.as_raw());

        let tgid = sys::thread_group_id(tid)?;
        info!(tid = tid.as_raw(), tgid = tgid.as_raw(), "adopting new tracee");

        Ok(Tracee::adopted(tid, tgid))
    }

    fn take(&mut self, tid: Pid) -> Result<Tracee> {
        self.tracees
            .remove(&tid.as_raw())
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not traced", tid)))
    }

    // Put a tracee taken out of the map back, unless it was detached.
    fn settle(&mut self, mut tracee: Tracee) {
        if let Some(event) = tracee.take_parked() {
            trace!(?event, "requeueing parked event");
            self.requeued.push_back(event);
        }

        if tracee.state() == TraceeState::Detached {
            let tgid = tracee.tgid();

            if self.owned.remove(&tgid.as_raw()) {
                debug!(tgid = tgid.as_raw(), "disowned detached thread group");
            }

            return;
        }

        self.tracees.insert(tracee.tid().as_raw(), tracee);
    }

    // Forget a tracee. If it was the last of an owned thread group, kill the group.
    fn remove(&mut self, tracee: Tracee) -> Result<()> {
        let tgid = tracee.tgid();

        info!(tid = tracee.tid().as_raw(), state = ?tracee.state(), "removing tracee");
        drop(tracee);

        let last = !self.tracees.values().any(|other| other.tgid() == tgid);

        if last && self.owned.remove(&tgid.as_raw()) {
            self.kill_thread_group(tgid)?;
        }

        Ok(())
    }

    fn kill_thread_group(&mut self, tgid: Pid) -> Result<()> {
        match signal::kill(tgid, Signal::SIGKILL) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(errno) => return Err(errno.into()),
        }

        info!(tgid = tgid.as_raw(), "killed owned thread group");

        // The leader's exit is only reported once every other thread is reaped.
        let threads = sys::threads(tgid).unwrap_or_default();

        for tid in threads.into_iter().filter(|tid| *tid != tgid) {
            self.reap(tid);
        }

        self.reap(tgid);

        Ok(())
    }

    // Wait until `tid` is gone, letting it run out of any stop.
    fn reap(&mut self, tid: Pid) {
        self.pending.remove(&tid.as_raw());

        loop {
            match event::wait(WaitTarget::Tid(tid)) {
                Ok(ProcessEvent::Retry) => continue,
                Ok(ProcessEvent::NoChildren) => break,
                Ok(event) if event.is_terminal() => {
                    trace!(tid = tid.as_raw(), ?event, "reaped killed thread");
                    break;
                }
                Ok(_) => {
                    let res = sys::restart(libc::PTRACE_CONT as RequestType, tid, 0);

                    if let Err(err) = res {
                        trace!(tid = tid.as_raw(), %err, "unable to continue killed thread");
                    }
                }
                Err(err) => {
                    warn!(tid = tid.as_raw(), %err, "unable to reap killed thread");
                    break;
                }
            }
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        let tids: Vec<i32> = self.tracees.keys().copied().collect();

        for tid in tids {
            let mut tracee = match self.tracees.remove(&tid) {
                Some(tracee) => tracee,
                None => continue,
            };

            if !self.owns(tracee.tgid()) && !tracee.state().is_terminal() {
                if let Err(err) = tracee.detach() {
                    debug!(tid, %err, "unable to detach tracee on drop");
                }
            }

            if let Err(err) = self.remove(tracee) {
                warn!(tid, %err, "unable to remove tracee on drop");
            }
        }

        for tgid in std::mem::take(&mut self.owned) {
            if let Err(err) = self.kill_thread_group(Pid::from_raw(tgid)) {
                warn!(tgid, %err, "unable to kill owned thread group on drop");
            }
        }

        debug_assert!(self.tracees.is_empty());
        debug_assert!(self.owned.is_empty());
    }
}

// The tracee may have been resumed or detached by the hook itself.
fn still_in(tracee: &Tracee, state: TraceeState) -> bool {
    let same = tracee.state() == state;

    if !same {
        debug!(
            tid = tracee.tid().as_raw(),
            before = ?state,
            after = ?tracee.state(),
            "hook already moved tracee out of its stop"
        );
    }

    same
}

// A tracee dying under us is expected. Its death is reported by a later event.
fn tolerate_death(res: Result<()>) -> Result<()> {
    match res {
        Err(err) if err.tracee_died() => {
            debug!(%err, "tracee died while handling stop");
            Ok(())
        }
        res => res,
    }
}
