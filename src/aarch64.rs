//! Register layouts for aarch64 and 32-bit arm, and host register I/O on arm hosts.

/// Size of the `svc` instruction in A64 and A32 state.
pub const SYSCALL_OP_SIZE: u64 = 4;

/// Size of the `svc` instruction in Thumb state.
pub const THUMB_SYSCALL_OP_SIZE: u64 = 2;

/// Thumb state bit of `cpsr`.
pub const PSR_T_BIT: u32 = 0x20;

/// Register set holding the kernel's view of the current syscall number.
///
/// Defined in [`include/uapi/linux/elf.h`](https://github.com/torvalds/linux/blob/master/include/uapi/linux/elf.h).
pub(crate) const NT_ARM_SYSTEM_CALL: i32 = 0x404;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://github.com/torvalds/linux/blob/master/arch/arm64/include/uapi/asm/ptrace.h).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Aarch64UserRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// `struct pt_regs` of 32-bit arm, as reported for both native and compat tracees.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArmUserRegs {
    pub uregs: [u32; 18],
}

impl ArmUserRegs {
    pub const SP: usize = 13;
    pub const LR: usize = 14;
    pub const PC: usize = 15;
    pub const CPSR: usize = 16;
    pub const ORIG_R0: usize = 17;

    /// True if the tracee is executing Thumb instructions.
    pub fn is_thumb(&self) -> bool {
        self.uregs[Self::CPSR] & PSR_T_BIT != 0
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) use self::host_aarch64::{read_registers, write_registers};

#[cfg(target_arch = "arm")]
pub(crate) use self::host_arm::{read_registers, write_registers};

#[cfg(target_arch = "aarch64")]
mod host_aarch64 {
    use std::mem;

    use super::{Aarch64UserRegs, ArmUserRegs, NT_ARM_SYSTEM_CALL};
    use crate::error::Result;
    use crate::regs::Registers;
    use crate::sys::{self, NT_PRSTATUS};
    use crate::Pid;

    pub(crate) fn read_registers(tid: Pid) -> Result<Registers> {
        let mut raw = Aarch64UserRegs::default();
        let len = sys::getregset(tid, NT_PRSTATUS, &mut raw)?;

        let mut syscall: i32 = 0;
        sys::getregset(tid, NT_ARM_SYSTEM_CALL, &mut syscall)?;

        if len == mem::size_of::<Aarch64UserRegs>() {
            Ok(Registers::Aarch64 { regs: raw, syscall })
        } else if len == mem::size_of::<ArmUserRegs>() {
            // SAFETY: the kernel wrote the compat layout into the head of `raw`, which is
            // larger and at least as strictly aligned. Any bit pattern is valid.
            let regs = unsafe { std::ptr::read(&raw as *const Aarch64UserRegs as *const ArmUserRegs) };

            Ok(Registers::Arm { regs, syscall })
        } else {
            internal_error!(format!("unexpected NT_PRSTATUS size {} for {}", len, tid))
        }
    }

    pub(crate) fn write_registers(tid: Pid, regs: &Registers) -> Result<()> {
        match regs {
            Registers::Aarch64 { regs, syscall } => {
                sys::setregset(tid, NT_PRSTATUS, regs)?;
                sys::setregset(tid, NT_ARM_SYSTEM_CALL, syscall)
            }
            Registers::Arm { regs, syscall } => {
                sys::setregset(tid, NT_PRSTATUS, regs)?;
                sys::setregset(tid, NT_ARM_SYSTEM_CALL, syscall)
            }
            _ => Err(crate::Error::Unsupported(format!(
                "{:?} registers on an aarch64 host",
                regs.abi()
            ))),
        }
    }
}

#[cfg(target_arch = "arm")]
mod host_arm {
    use libc::c_void;
    use nix::sys::ptrace::RequestType;

    use super::ArmUserRegs;
    use crate::error::{Result, ResultExt};
    use crate::regs::Registers;
    use crate::sys::{self, NT_PRSTATUS};
    use crate::Pid;

    /// Defined in `arch/arm/include/uapi/asm/ptrace.h`.
    const PTRACE_SET_SYSCALL: RequestType = 23;

    pub(crate) fn read_registers(tid: Pid) -> Result<Registers> {
        let mut regs = ArmUserRegs::default();
        sys::getregset(tid, NT_PRSTATUS, &mut regs)?;

        // Native arm has no regset for the syscall number. `r7` holds it at every
        // syscall stop we did not rewrite ourselves.
        let syscall = regs.uregs[7] as i32;

        Ok(Registers::Arm { regs, syscall })
    }

    pub(crate) fn write_registers(tid: Pid, regs: &Registers) -> Result<()> {
        match regs {
            Registers::Arm { regs, syscall } => {
                sys::setregset(tid, NT_PRSTATUS, regs)?;

                // SAFETY: `PTRACE_SET_SYSCALL` ignores `addr` and reads `data` as an int.
                unsafe {
                    sys::raw_ptrace(
                        PTRACE_SET_SYSCALL,
                        tid,
                        std::ptr::null_mut(),
                        *syscall as isize as *mut c_void,
                    )
                }
                .died_if_esrch(tid)?;

                Ok(())
            }
            _ => Err(crate::Error::Unsupported(format!(
                "{:?} registers on an arm host",
                regs.abi()
            ))),
        }
    }
}
