//! Running syscalls on behalf of the tracer inside a stopped tracee.
//!
//! An injection rewrites the registers at a syscall stop so that the tracee executes the
//! injected syscall next, and restores the original registers once the injected syscall
//! exits. Issued at an entry stop, the tracee's own syscall is displaced and runs again
//! afterwards. Issued at an exit stop, the tracee is rewound to the syscall instruction.

use nix::errno::Errno;
use nix::sys::ptrace::RequestType;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{self, ProcessEvent, WaitTarget};
use crate::regs::{Abi, Registers};
use crate::sys;
use crate::sysno;
use crate::tracee::{ExecMode, InjectionBackup, Suppression, SysCallStatus, Tracee, TraceeState};

/// Offsets passed to `mmap2` are in units of this size, whatever the page size.
const MMAP2_UNIT: u64 = 4096;

impl Tracee {
    /// Arrange for syscall `nr` to run with `args` when the tracee is next resumed.
    ///
    /// The injected syscall is reported like any other, with status
    /// [`SysCallStatus::Injected`]. Resuming from its exit stop restores the tracee.
    pub fn inject_syscall_async(&mut self, nr: i64, args: [u64; 6]) -> Result<()> {
        if !self.state.is_syscall_stop() {
            return Err(self.invalid_state("inject a syscall"));
        }

        if self.injection.is_some() || self.suppression.is_some() {
            return Err(Error::InvalidArgument(format!(
                "syscall {} injected into {} while another rewrite is in flight",
                nr, self.tid
            )));
        }

        let backup = *self.registers()?;
        let abi = backup.abi();

        if sysno::is_exec(abi, nr) {
            return Err(Error::InvalidArgument(format!(
                "exec syscall {} cannot be injected",
                nr
            )));
        }

        let mut regs = backup;

        match self.state {
            TraceeState::PreSysCallStop => {
                regs.set_ptrace_syscall(nr);
            }
            _ => {
                regs.set_ip(regs.ip().wrapping_sub(regs.syscall_op_size()));
                regs.set_pending_syscall(nr);
            }
        }

        regs.set_args(args);
        self.write_registers(regs)?;

        self.injection = Some(InjectionBackup {
            regs: backup,
            exec_mode: self.exec_mode,
            at_origin: true,
        });
        self.syscall_status = SysCallStatus::Injected;

        debug!(
            tid = self.tid.as_raw(),
            %abi,
            nr,
            name = sysno::name(abi, nr),
            state = ?self.state,
            "injected syscall"
        );

        Ok(())
    }

    /// Run syscall `nr` with `args` to completion, and return its raw return value.
    ///
    /// On return, the tracee is back at the syscall stop it was called from: the entry of
    /// its own (repeated) syscall, or its exit with the original registers. Signals which
    /// arrive meanwhile are held back, and raised again afterwards.
    ///
    /// If the tracee dies meanwhile, it is marked as exited, its terminal event is parked
    /// for the tracer, and a `TraceeDied` error is returned.
    pub fn inject_syscall(&mut self, nr: i64, args: [u64; 6]) -> Result<u64> {
        let origin = self.state;

        self.inject_syscall_async(nr, args)?;

        let res = self.run_injected(origin);

        if res.is_ok() {
            self.syscall_status = SysCallStatus::Normal;
        }
        self.settle_deferred_signals(&res);

        res
    }

    fn run_injected(&mut self, origin: TraceeState) -> Result<u64> {
        match origin {
            TraceeState::PreSysCallStop => {
                // Injected syscall exit.
                self.resume_until_syscall_stop(TraceeState::PostSysCallStop)?;
                let ret = self.registers()?.return_value();

                // The displaced syscall, about to run again.
                self.resume_until_syscall_stop(TraceeState::PreSysCallStop)?;

                Ok(ret)
            }
            _ => {
                self.resume_until_syscall_stop(TraceeState::PreSysCallStop)?;
                self.resume_until_syscall_stop(TraceeState::PostSysCallStop)?;
                let ret = self.registers()?.return_value();

                self.restore_in_place()?;

                Ok(ret)
            }
        }
    }

    /// Skip the syscall at the current entry stop, and make it return `return_value`.
    ///
    /// The syscall is replaced by the harmless `getpid`. The original syscall number and
    /// the fake return value are put in place at the exit stop, by
    /// [`Tracee::syscall_exit_pre_hook`].
    pub fn suppress_syscall(&mut self, return_value: u64) -> Result<()> {
        if self.state != TraceeState::PreSysCallStop {
            return Err(self.invalid_state("suppress a syscall"));
        }

        if self.injection.is_some() || self.suppression.is_some() {
            return Err(Error::InvalidArgument(format!(
                "syscall of {} suppressed while another rewrite is in flight",
                self.tid
            )));
        }

        let mut regs = *self.registers()?;
        let abi = regs.abi();
        let harmless = remote_sysno(abi, "getpid")?;
        let original = regs.ptrace_syscall();

        regs.set_ptrace_syscall(harmless);
        self.write_registers(regs)?;

        self.suppression = Some(Suppression {
            original,
            return_value,
        });

        debug!(tid = self.tid.as_raw(), nr = original, return_value, "suppressing syscall");

        Ok(())
    }

    /// Map memory in the tracee, returning the address of the mapping.
    ///
    /// ABIs with 32-bit registers use `mmap2`, so `offset` must be a multiple of 4096 there.
    pub fn mmap(
        &mut self,
        addr: u64,
        len: u64,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> Result<u64> {
        let abi = self.registers()?.abi();

        let (name, offset) = if abi.register_bits() == 64 {
            ("mmap", offset)
        } else {
            if offset % MMAP2_UNIT != 0 {
                return Err(Error::InvalidArgument(format!(
                    "mmap2 offset {:#x} is not a multiple of {}",
                    offset, MMAP2_UNIT
                )));
            }

            let units = offset / MMAP2_UNIT;

            if units > u64::from(u32::MAX) {
                return Err(Error::Overflow {
                    addr: offset,
                    len: len as usize,
                });
            }

            ("mmap2", units)
        };

        let nr = remote_sysno(abi, name)?;
        let args = [
            addr,
            len,
            prot as i64 as u64,
            flags as i64 as u64,
            fd as i64 as u64,
            offset,
        ];

        let ret = self.inject_syscall(nr, args)?;

        abi.decode_return(ret)
            .map_err(|source| Error::RemoteSyscall { name, source })
    }

    /// Unmap memory in the tracee.
    pub fn munmap(&mut self, addr: u64, len: u64) -> Result<()> {
        let abi = self.registers()?.abi();
        let nr = remote_sysno(abi, "munmap")?;

        let ret = self.inject_syscall(nr, [addr, len, 0, 0, 0, 0])?;

        abi.decode_return(ret)
            .map(drop)
            .map_err(|source| Error::RemoteSyscall { name: "munmap", source })
    }

    // True when resuming would leave the exit stop of an asynchronously injected syscall.
    pub(crate) fn completing_injection(&self) -> bool {
        self.state == TraceeState::PostSysCallStop
            && self.injection.map_or(false, |injection| !injection.at_origin)
    }

    // Restore the tracee's registers after its injected syscall, before resuming.
    pub(crate) fn finish_injection(&mut self) -> Result<()> {
        let injection = match self.injection.take() {
            Some(injection) => injection,
            None => internal_error!("no injection to finish"),
        };

        let regs = completed_registers(&injection);
        self.write_registers(regs)?;

        self.syscall_status = match injection.exec_mode {
            ExecMode::User => SysCallStatus::Repeated,
            ExecMode::Kernel => SysCallStatus::Normal,
        };

        trace!(tid = self.tid.as_raw(), status = ?self.syscall_status, "finished injection");

        Ok(())
    }

    // Put back the registers of an exit-side injection at the injected syscall's exit.
    fn restore_in_place(&mut self) -> Result<()> {
        let injection = match self.injection.take() {
            Some(injection) => injection,
            None => internal_error!("no injection to restore"),
        };

        self.write_registers(injection.regs)?;
        self.syscall_status = SysCallStatus::Normal;

        Ok(())
    }

    // Undo or complete an in-flight injection, so the tracee can run on its own.
    pub(crate) fn abandon_injection(&mut self) -> Result<()> {
        let injection = match self.injection {
            Some(injection) => injection,
            None => return Ok(()),
        };

        let regs = if injection.at_origin {
            // The injected syscall has not been entered yet.
            injection.regs
        } else if self.state == TraceeState::PreSysCallStop {
            return Err(Error::InvalidArgument(format!(
                "{} is at the entry of an injected syscall",
                self.tid
            )));
        } else {
            completed_registers(&injection)
        };

        if self.state.is_syscall_stop() {
            self.write_registers(regs)?;
        } else {
            regs.write(self.tid)?;
        }

        self.injection = None;
        self.syscall_status = SysCallStatus::Normal;

        debug!(tid = self.tid.as_raw(), "abandoned injection");

        Ok(())
    }

    // Resume, and wait on this tracee alone until its next syscall stop.
    fn resume_until_syscall_stop(&mut self, expected: TraceeState) -> Result<()> {
        self.continue_exec(0)?;

        loop {
            let event = event::wait(WaitTarget::Tid(self.tid))?;

            match event {
                ProcessEvent::Retry => continue,
                ProcessEvent::NoChildren => {
                    self.mark_exited();
                    return Err(self.died(Errno::ECHILD));
                }
                event if event.is_terminal() => {
                    debug!(tid = self.tid.as_raw(), ?event, "tracee died during injection");

                    self.observe(&event);
                    self.parked = Some(event);
                    return Err(self.died(Errno::ESRCH));
                }
                ProcessEvent::SyscallStop { .. } => {
                    self.observe(&event);
                    break;
                }
                ProcessEvent::SignalDeliveryStop { signal, .. } => {
                    trace!(tid = self.tid.as_raw(), signal, "deferring signal during injection");

                    self.deferred_signals.push(signal);
                    self.observe(&event);
                    self.resume(libc::PTRACE_SYSCALL as RequestType, 0)?;
                }
                event => {
                    trace!(tid = self.tid.as_raw(), ?event, "skipping stop during injection");

                    self.observe(&event);
                    self.resume(libc::PTRACE_SYSCALL as RequestType, 0)?;
                }
            }
        }

        if self.state != expected {
            internal_error!(format!(
                "expected {:?} during injection into {}, found {:?}",
                expected, self.tid, self.state
            ));
        }

        Ok(())
    }

    // Deferred signals never outlive the synchronous injection that held them back.
    fn settle_deferred_signals<T>(&mut self, res: &Result<T>) {
        match res {
            Err(err) if err.tracee_died() => self.deferred_signals.clear(),
            _ => self.raise_deferred_signals(),
        }
    }

    fn raise_deferred_signals(&mut self) {
        for signal in std::mem::take(&mut self.deferred_signals) {
            if let Err(errno) = sys::tgkill(self.tgid(), self.tid, signal) {
                warn!(tid = self.tid.as_raw(), signal, %errno, "unable to re-raise deferred signal");
            }
        }
    }
}

// Registers to resume with once the injected syscall has exited.
fn completed_registers(injection: &InjectionBackup) -> Registers {
    let mut regs = injection.regs;

    if injection.exec_mode == ExecMode::User {
        // Issued at entry: run the displaced syscall again.
        let nr = regs.ptrace_syscall();
        regs.set_ip(regs.ip().wrapping_sub(regs.syscall_op_size()));
        regs.set_pending_syscall(nr);
    }

    regs
}

fn remote_sysno(abi: Abi, name: &'static str) -> Result<i64> {
    sysno::number(abi, name)
        .ok_or_else(|| Error::Unsupported(format!("no `{}` syscall for {} tracees", name, abi)))
}
