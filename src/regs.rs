//! ABI-neutral access to a tracee's general purpose registers.
//!
//! Syscall arguments, return values and the instruction pointer are exposed as `u64`,
//! and syscall numbers as `i64`, regardless of the tracee's register width. On 32-bit
//! ABIs, setters truncate to the low 32 bits. Getters zero-extend, except for syscall
//! numbers, which are sign-extended so that "no syscall" reads back as `-1`.

use std::fmt;
use std::mem;
use std::slice;

use nix::errno::Errno;

use crate::aarch64::{self, Aarch64UserRegs, ArmUserRegs};
use crate::error::{Error, Result};
use crate::x86::{self, X86UserRegs, X86_64UserRegs};
use crate::Pid;

/// Largest magnitude of a negated `errno` returned by a syscall.
const MAX_ERRNO: u64 = 4095;

/// Syscall calling convention of a tracee.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Abi {
    X86_64,
    X32,
    X86,
    Aarch64,
    Arm,
}

impl Abi {
    /// ABIs whose tracees can be inspected from the current host.
    pub fn supported() -> &'static [Abi] {
        #[cfg(target_arch = "x86_64")]
        return &[Abi::X86_64, Abi::X32, Abi::X86];

        #[cfg(target_arch = "x86")]
        return &[Abi::X86];

        #[cfg(target_arch = "aarch64")]
        return &[Abi::Aarch64, Abi::Arm];

        #[cfg(target_arch = "arm")]
        return &[Abi::Arm];

        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "x86",
            target_arch = "aarch64",
            target_arch = "arm"
        )))]
        return &[];
    }

    /// Width of syscall argument registers, in bits.
    ///
    /// x32 passes syscall arguments in full 64-bit registers.
    pub fn register_bits(self) -> u32 {
        match self {
            Abi::X86_64 | Abi::X32 | Abi::Aarch64 => 64,
            Abi::X86 | Abi::Arm => 32,
        }
    }

    /// Truncate `value` to the register width.
    pub fn truncate(self, value: u64) -> u64 {
        match self.register_bits() {
            32 => u64::from(value as u32),
            _ => value,
        }
    }

    /// Sign-extend a raw register value from the register width.
    pub fn sign_extend(self, value: u64) -> i64 {
        match self.register_bits() {
            32 => i64::from(value as u32 as i32),
            _ => value as i64,
        }
    }

    /// Decode a raw syscall return value.
    ///
    /// Values in `-4095..=-1` (after sign extension) are failures carrying an `errno`.
    pub fn decode_return(self, value: u64) -> std::result::Result<u64, Errno> {
        let signed = self.sign_extend(value);

        if signed < 0 && signed.unsigned_abs() <= MAX_ERRNO {
            Err(Errno::from_i32(-signed as i32))
        } else {
            Ok(self.truncate(value))
        }
    }

    /// True if the kernel forgets the syscall number across a successful `execve()`.
    pub(crate) fn clears_syscall_on_exec(self) -> bool {
        matches!(self, Abi::Aarch64 | Abi::Arm)
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Abi::X86_64 => "x86_64",
            Abi::X32 => "x32",
            Abi::X86 => "i386",
            Abi::Aarch64 => "aarch64",
            Abi::Arm => "arm",
        };

        f.write_str(name)
    }
}

/// A snapshot of a tracee's general purpose registers, tagged with its ABI.
///
/// On aarch64 and compat arm tracees, the kernel's notion of the current syscall number
/// lives outside the general purpose registers, so it is carried alongside them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Registers {
    X86_64(X86_64UserRegs),
    X32(X86_64UserRegs),
    X86(X86UserRegs),
    Aarch64 { regs: Aarch64UserRegs, syscall: i32 },
    Arm { regs: ArmUserRegs, syscall: i32 },
}

impl Registers {
    /// Zeroed registers for `abi`.
    pub fn new(abi: Abi) -> Self {
        match abi {
            Abi::X86_64 => Registers::X86_64(X86_64UserRegs::default()),
            Abi::X32 => Registers::X32(X86_64UserRegs::default()),
            Abi::X86 => Registers::X86(X86UserRegs::default()),
            Abi::Aarch64 => Registers::Aarch64 {
                regs: Aarch64UserRegs::default(),
                syscall: 0,
            },
            Abi::Arm => Registers::Arm {
                regs: ArmUserRegs::default(),
                syscall: 0,
            },
        }
    }

    /// Interpret a raw `NT_PRSTATUS` capture in the kernel layout of `abi`.
    ///
    /// For arm ABIs, the syscall number is initialized from the syscall number register.
    pub fn from_bytes(abi: Abi, bytes: &[u8]) -> Result<Self> {
        fn read<T: Copy>(bytes: &[u8]) -> Result<T> {
            if bytes.len() != mem::size_of::<T>() {
                return Err(Error::InvalidArgument(format!(
                    "register capture of {} bytes, expected {}",
                    bytes.len(),
                    mem::size_of::<T>()
                )));
            }

            // SAFETY: the length matches, and register layouts are plain integers.
            Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) })
        }

        let regs = match abi {
            Abi::X86_64 => Registers::X86_64(read(bytes)?),
            Abi::X32 => Registers::X32(read(bytes)?),
            Abi::X86 => Registers::X86(read(bytes)?),
            Abi::Aarch64 => {
                let regs: Aarch64UserRegs = read(bytes)?;
                let syscall = regs.regs[8] as i32;
                Registers::Aarch64 { regs, syscall }
            }
            Abi::Arm => {
                let regs: ArmUserRegs = read(bytes)?;
                let syscall = regs.uregs[7] as i32;
                Registers::Arm { regs, syscall }
            }
        };

        Ok(regs)
    }

    /// The raw `NT_PRSTATUS` image of these registers.
    pub fn as_bytes(&self) -> &[u8] {
        fn bytes<T>(value: &T) -> &[u8] {
            // SAFETY: register layouts are `repr(C)` integers without padding.
            unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
        }

        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => bytes(regs),
            Registers::X86(regs) => bytes(regs),
            Registers::Aarch64 { regs, .. } => bytes(regs),
            Registers::Arm { regs, .. } => bytes(regs),
        }
    }

    /// Read the registers of the stopped tracee `tid`.
    pub fn read(tid: Pid) -> Result<Self> {
        host::read_registers(tid)
    }

    /// Write these registers to the stopped tracee `tid`.
    pub fn write(&self, tid: Pid) -> Result<()> {
        host::write_registers(tid, self)
    }

    pub fn abi(&self) -> Abi {
        match self {
            Registers::X86_64(_) => Abi::X86_64,
            Registers::X32(_) => Abi::X32,
            Registers::X86(_) => Abi::X86,
            Registers::Aarch64 { .. } => Abi::Aarch64,
            Registers::Arm { .. } => Abi::Arm,
        }
    }

    /// The syscall number the kernel will act on (or has acted on) at a syscall stop.
    ///
    /// This is `orig_rax` on x86, which the kernel reports as `-1` outside of syscalls.
    pub fn ptrace_syscall(&self) -> i64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.orig_rax as i64,
            Registers::X86(regs) => i64::from(regs.orig_eax as i32),
            Registers::Aarch64 { syscall, .. } | Registers::Arm { syscall, .. } => {
                i64::from(*syscall)
            }
        }
    }

    pub fn set_ptrace_syscall(&mut self, nr: i64) {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.orig_rax = nr as u64,
            Registers::X86(regs) => regs.orig_eax = nr as u32,
            Registers::Aarch64 { syscall, .. } | Registers::Arm { syscall, .. } => {
                *syscall = nr as i32
            }
        }
    }

    /// The syscall number register read by the syscall instruction.
    pub fn pending_syscall(&self) -> i64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rax as i64,
            Registers::X86(regs) => i64::from(regs.eax as i32),
            Registers::Aarch64 { regs, .. } => regs.regs[8] as i64,
            Registers::Arm { regs, .. } => i64::from(regs.uregs[7] as i32),
        }
    }

    pub fn set_pending_syscall(&mut self, nr: i64) {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rax = nr as u64,
            Registers::X86(regs) => regs.eax = nr as u32,
            Registers::Aarch64 { regs, .. } => regs.regs[8] = nr as u64,
            Registers::Arm { regs, .. } => regs.uregs[7] = nr as u32,
        }
    }

    /// Syscall argument `index`, or `None` unless `index < 6`.
    pub fn arg(&self, index: usize) -> Option<u64> {
        if index < 6 {
            Some(self.arg_at(index))
        } else {
            None
        }
    }

    pub fn set_arg(&mut self, index: usize, value: u64) -> Result<()> {
        if index >= 6 {
            return Err(Error::InvalidArgument(format!(
                "syscall argument index out of range: {}",
                index
            )));
        }

        self.set_arg_at(index, value);

        Ok(())
    }

    // Index 5 and above all name the last argument register.
    fn arg_at(&self, index: usize) -> u64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => match index {
                0 => regs.rdi,
                1 => regs.rsi,
                2 => regs.rdx,
                3 => regs.r10,
                4 => regs.r8,
                _ => regs.r9,
            },
            Registers::X86(regs) => {
                let value = match index {
                    0 => regs.ebx,
                    1 => regs.ecx,
                    2 => regs.edx,
                    3 => regs.esi,
                    4 => regs.edi,
                    _ => regs.ebp,
                };
                u64::from(value)
            }
            Registers::Aarch64 { regs, .. } => regs.regs[index.min(5)],
            Registers::Arm { regs, .. } => u64::from(regs.uregs[index.min(5)]),
        }
    }

    fn set_arg_at(&mut self, index: usize, value: u64) {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => {
                let slot = match index {
                    0 => &mut regs.rdi,
                    1 => &mut regs.rsi,
                    2 => &mut regs.rdx,
                    3 => &mut regs.r10,
                    4 => &mut regs.r8,
                    _ => &mut regs.r9,
                };
                *slot = value;
            }
            Registers::X86(regs) => {
                let slot = match index {
                    0 => &mut regs.ebx,
                    1 => &mut regs.ecx,
                    2 => &mut regs.edx,
                    3 => &mut regs.esi,
                    4 => &mut regs.edi,
                    _ => &mut regs.ebp,
                };
                *slot = value as u32;
            }
            Registers::Aarch64 { regs, .. } => regs.regs[index.min(5)] = value,
            Registers::Arm { regs, .. } => regs.uregs[index.min(5)] = value as u32,
        }
    }

    pub fn args(&self) -> [u64; 6] {
        let mut args = [0; 6];

        for (index, arg) in args.iter_mut().enumerate() {
            *arg = self.arg_at(index);
        }

        args
    }

    pub fn set_args(&mut self, args: [u64; 6]) {
        for (index, arg) in args.iter().enumerate() {
            self.set_arg_at(index, *arg);
        }
    }

    pub fn return_value(&self) -> u64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rax,
            Registers::X86(regs) => u64::from(regs.eax),
            Registers::Aarch64 { regs, .. } => regs.regs[0],
            Registers::Arm { regs, .. } => u64::from(regs.uregs[0]),
        }
    }

    pub fn set_return_value(&mut self, value: u64) {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rax = value,
            Registers::X86(regs) => regs.eax = value as u32,
            Registers::Aarch64 { regs, .. } => regs.regs[0] = value,
            Registers::Arm { regs, .. } => regs.uregs[0] = value as u32,
        }
    }

    pub fn ip(&self) -> u64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rip,
            Registers::X86(regs) => u64::from(regs.eip),
            Registers::Aarch64 { regs, .. } => regs.pc,
            Registers::Arm { regs, .. } => u64::from(regs.uregs[ArmUserRegs::PC]),
        }
    }

    pub fn set_ip(&mut self, ip: u64) {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rip = ip,
            Registers::X86(regs) => regs.eip = ip as u32,
            Registers::Aarch64 { regs, .. } => regs.pc = ip,
            Registers::Arm { regs, .. } => regs.uregs[ArmUserRegs::PC] = ip as u32,
        }
    }

    pub fn sp(&self) -> u64 {
        match self {
            Registers::X86_64(regs) | Registers::X32(regs) => regs.rsp,
            Registers::X86(regs) => u64::from(regs.esp),
            Registers::Aarch64 { regs, .. } => regs.sp,
            Registers::Arm { regs, .. } => u64::from(regs.uregs[ArmUserRegs::SP]),
        }
    }

    /// Size of the instruction that entered the current syscall.
    pub fn syscall_op_size(&self) -> u64 {
        match self {
            Registers::X86_64(_) | Registers::X32(_) | Registers::X86(_) => x86::SYSCALL_OP_SIZE,
            Registers::Aarch64 { .. } => aarch64::SYSCALL_OP_SIZE,
            Registers::Arm { regs, .. } if regs.is_thumb() => aarch64::THUMB_SYSCALL_OP_SIZE,
            Registers::Arm { .. } => aarch64::SYSCALL_OP_SIZE,
        }
    }
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
use crate::x86 as host;

#[cfg(any(target_arch = "aarch64", target_arch = "arm"))]
use crate::aarch64 as host;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm"
)))]
mod host {
    use super::Registers;
    use crate::error::{Error, Result};
    use crate::Pid;

    pub(crate) fn read_registers(_tid: Pid) -> Result<Registers> {
        Err(Error::Unsupported("register access on this host".into()))
    }

    pub(crate) fn write_registers(_tid: Pid, _regs: &Registers) -> Result<()> {
        Err(Error::Unsupported("register access on this host".into()))
    }
}
