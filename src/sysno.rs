//! Syscall name and number tables for every supported ABI.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use lazy_static::lazy_static;
use syscalls::{aarch64, arm, x86, x86_64};

use crate::regs::Abi;
use crate::x86::X32_SYSCALL_BIT;

/// Syscalls whose x32 entry points differ from their x86_64 counterparts.
///
/// Defined in [`arch/x86/entry/syscalls/syscall_64.tbl`](https://github.com/torvalds/linux/blob/master/arch/x86/entry/syscalls/syscall_64.tbl).
/// The 64-bit numbers of these syscalls are not valid on x32.
const X32_COMPAT_SYSCALLS: &[(&str, i64)] = &[
    ("rt_sigaction", 512),
    ("rt_sigreturn", 513),
    ("ioctl", 514),
    ("readv", 515),
    ("writev", 516),
    ("recvfrom", 517),
    ("sendmsg", 518),
    ("recvmsg", 519),
    ("execve", 520),
    ("ptrace", 521),
    ("rt_sigpending", 522),
    ("rt_sigtimedwait", 523),
    ("rt_sigqueueinfo", 524),
    ("sigaltstack", 525),
    ("timer_create", 526),
    ("mq_notify", 527),
    ("kexec_load", 528),
    ("waitid", 529),
    ("set_robust_list", 530),
    ("get_robust_list", 531),
    ("vmsplice", 532),
    ("move_pages", 533),
    ("preadv", 534),
    ("pwritev", 535),
    ("rt_tgsigqueueinfo", 536),
    ("recvmmsg", 537),
    ("sendmmsg", 538),
    ("process_vm_readv", 539),
    ("process_vm_writev", 540),
    ("setsockopt", 541),
    ("getsockopt", 542),
    ("io_setup", 543),
    ("io_submit", 544),
    ("execveat", 545),
    ("preadv2", 546),
    ("pwritev2", 547),
];

/// Upper bound of native x86_64 syscall numbers, exclusive.
const X86_64_MAX: usize = 512;

struct X32Table {
    by_name: BTreeMap<&'static str, i64>,
    by_number: BTreeMap<i64, &'static str>,
}

impl X32Table {
    fn build() -> Self {
        let mut by_name = BTreeMap::new();

        for id in 0..X86_64_MAX {
            if let Some(sysno) = x86_64::Sysno::new(id) {
                by_name.insert(sysno.name(), id as i64 | X32_SYSCALL_BIT as i64);
            }
        }

        for (name, nr) in X32_COMPAT_SYSCALLS {
            by_name.insert(*name, nr | X32_SYSCALL_BIT as i64);
        }

        let by_number = by_name.iter().map(|(name, nr)| (*nr, *name)).collect();

        Self { by_name, by_number }
    }
}

lazy_static! {
    static ref X32_TABLE: X32Table = X32Table::build();
}

/// Look up the number of the syscall `name` in `abi`.
///
/// Returns `None` if `abi` has no such syscall.
pub fn number(abi: Abi, name: &str) -> Option<i64> {
    match abi {
        Abi::X86_64 => name.parse::<x86_64::Sysno>().ok().map(|s| i64::from(s.id())),
        Abi::X32 => X32_TABLE.by_name.get(name).copied(),
        Abi::X86 => name.parse::<x86::Sysno>().ok().map(|s| i64::from(s.id())),
        Abi::Aarch64 => name.parse::<aarch64::Sysno>().ok().map(|s| i64::from(s.id())),
        Abi::Arm => name.parse::<arm::Sysno>().ok().map(|s| i64::from(s.id())),
    }
}

/// Look up the name of syscall number `nr` in `abi`.
pub fn name(abi: Abi, nr: i64) -> Option<&'static str> {
    if abi == Abi::X32 {
        return X32_TABLE.by_number.get(&nr).copied();
    }

    let id = usize::try_from(nr).ok()?;

    match abi {
        Abi::X86_64 => x86_64::Sysno::new(id).map(|s| s.name()),
        Abi::X86 => x86::Sysno::new(id).map(|s| s.name()),
        Abi::Aarch64 => aarch64::Sysno::new(id).map(|s| s.name()),
        Abi::Arm => arm::Sysno::new(id).map(|s| s.name()),
        Abi::X32 => None,
    }
}

/// True for syscalls that replace the calling process image.
pub fn is_exec(abi: Abi, nr: i64) -> bool {
    matches!(name(abi, nr), Some("execve") | Some("execveat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_numbers() {
        assert_eq!(number(Abi::X86_64, "getpid"), Some(39));
        assert_eq!(number(Abi::X86, "getpid"), Some(20));
        assert_eq!(number(Abi::Aarch64, "getpid"), Some(172));
        assert_eq!(number(Abi::Arm, "getpid"), Some(20));

        assert_eq!(number(Abi::X86, "mmap2"), Some(192));
        assert_eq!(number(Abi::Arm, "mmap2"), Some(192));
        assert_eq!(number(Abi::X86_64, "mmap2"), None);
        assert_eq!(number(Abi::X86_64, "not_a_syscall"), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(name(Abi::X86_64, 59), Some("execve"));
        assert_eq!(name(Abi::Aarch64, 221), Some("execve"));
        assert_eq!(name(Abi::X86_64, -1), None);
    }

    #[test]
    fn test_x32_numbers() {
        assert_eq!(number(Abi::X32, "getpid"), Some(39 | 0x4000_0000));
        assert_eq!(number(Abi::X32, "execve"), Some(520 | 0x4000_0000));
        assert_eq!(number(Abi::X32, "pwritev2"), Some(547 | 0x4000_0000));

        assert_eq!(name(Abi::X32, 39 | 0x4000_0000), Some("getpid"));
        assert_eq!(name(Abi::X32, 520 | 0x4000_0000), Some("execve"));

        // The 64-bit entry point of a compat syscall is not valid on x32.
        assert_eq!(name(Abi::X32, 59 | 0x4000_0000), None);
        assert_eq!(name(Abi::X32, 39), None);
    }

    #[test]
    fn test_is_exec() {
        assert!(is_exec(Abi::X86_64, 59));
        assert!(is_exec(Abi::X86_64, 322));
        assert!(is_exec(Abi::X86, 11));
        assert!(is_exec(Abi::X32, 545 | 0x4000_0000));
        assert!(!is_exec(Abi::X86_64, 39));
    }
}
