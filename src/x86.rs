//! Register layouts for the x86 family, and host register I/O on x86 hosts.

/// Size of the `syscall`, `sysenter` and `int $0x80` instructions.
pub const SYSCALL_OP_SIZE: u64 = 2;

/// Set in the syscall number of every x32 syscall.
pub const X32_SYSCALL_BIT: u64 = 0x4000_0000;

/// Defined in [`arch/x86/include/asm/user_64.h`](https://github.com/torvalds/linux/blob/master/arch/x86/include/asm/user_64.h).
///
/// Also used for x32 tracees, which the kernel reports with the full 64-bit layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct X86_64UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

/// The i386 `user_regs_struct`, as reported for 32-bit tracees of a 64-bit kernel.
///
/// The kernel declares segment registers as 16-bit halves padded to 32 bits. We keep them
/// as whole words, which preserves the layout on little-endian hosts.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct X86UserRegs {
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub eax: u32,
    pub xds: u32,
    pub xes: u32,
    pub xfs: u32,
    pub xgs: u32,
    pub orig_eax: u32,
    pub eip: u32,
    pub xcs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub xss: u32,
}

/// True if a 64-bit syscall number (as found in `orig_rax`) came from the x32 ABI.
pub fn is_x32_syscall(orig_rax: u64) -> bool {
    (orig_rax as i64) >= 0 && orig_rax & X32_SYSCALL_BIT != 0
}

#[cfg(target_arch = "x86_64")]
pub(crate) use self::host_x86_64::{read_registers, write_registers};

#[cfg(target_arch = "x86")]
pub(crate) use self::host_x86::{read_registers, write_registers};

#[cfg(target_arch = "x86_64")]
mod host_x86_64 {
    use std::mem;

    use super::{is_x32_syscall, X86UserRegs, X86_64UserRegs};
    use crate::error::Result;
    use crate::regs::Registers;
    use crate::sys::{self, NT_PRSTATUS};
    use crate::Pid;

    pub(crate) fn read_registers(tid: Pid) -> Result<Registers> {
        let mut raw = X86_64UserRegs::default();
        let len = sys::getregset(tid, NT_PRSTATUS, &mut raw)?;

        if len == mem::size_of::<X86_64UserRegs>() {
            if is_x32_syscall(raw.orig_rax) {
                Ok(Registers::X32(raw))
            } else {
                Ok(Registers::X86_64(raw))
            }
        } else if len == mem::size_of::<X86UserRegs>() {
            // SAFETY: the kernel wrote the compat layout into the head of `raw`, which is
            // larger and at least as strictly aligned. Any bit pattern is valid.
            let compat = unsafe { std::ptr::read(&raw as *const X86_64UserRegs as *const X86UserRegs) };

            Ok(Registers::X86(compat))
        } else {
            internal_error!(format!("unexpected NT_PRSTATUS size {} for {}", len, tid))
        }
    }

    pub(crate) fn write_registers(tid: Pid, regs: &Registers) -> Result<()> {
        match regs {
            Registers::X86_64(raw) | Registers::X32(raw) => sys::setregset(tid, NT_PRSTATUS, raw),
            Registers::X86(raw) => sys::setregset(tid, NT_PRSTATUS, raw),
            _ => Err(crate::Error::Unsupported(format!(
                "{:?} registers on an x86_64 host",
                regs.abi()
            ))),
        }
    }
}

#[cfg(target_arch = "x86")]
mod host_x86 {
    use super::X86UserRegs;
    use crate::error::Result;
    use crate::regs::Registers;
    use crate::sys::{self, NT_PRSTATUS};
    use crate::Pid;

    pub(crate) fn read_registers(tid: Pid) -> Result<Registers> {
        let mut raw = X86UserRegs::default();
        sys::getregset(tid, NT_PRSTATUS, &mut raw)?;

        Ok(Registers::X86(raw))
    }

    pub(crate) fn write_registers(tid: Pid, regs: &Registers) -> Result<()> {
        match regs {
            Registers::X86(raw) => sys::setregset(tid, NT_PRSTATUS, raw),
            _ => Err(crate::Error::Unsupported(format!(
                "{:?} registers on an x86 host",
                regs.abi()
            ))),
        }
    }
}
