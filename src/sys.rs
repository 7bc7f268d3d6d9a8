//! Thin wrappers over raw ptrace requests and `/proc` lookups that `nix` does not cover.

use std::fs;
use std::io;
use std::mem;

use libc::c_void;
use nix::errno::Errno;
use nix::sys::ptrace::RequestType;

use crate::error::{Error, Result, ResultExt};
use crate::Pid;

/// Linux constant defined in `include/uapi/linux/elf.h`.
pub(crate) const NT_PRSTATUS: i32 = 0x1;

/// Issue a ptrace request with pointer-sized `addr` and `data` arguments.
///
/// # Safety
///
/// `addr` and `data` must be valid for `request`, as documented in `ptrace(2)`.
pub(crate) unsafe fn raw_ptrace(
    request: RequestType,
    tid: Pid,
    addr: *mut c_void,
    data: *mut c_void,
) -> std::result::Result<libc::c_long, Errno> {
    Errno::result(libc::ptrace(request, tid.as_raw(), addr, data))
}

/// Resume or detach a stopped tracee, optionally delivering the raw signal `signal`.
///
/// `nix` models signals as an enum without realtime signals, so the signal number is
/// passed through untouched.
pub(crate) fn restart(request: RequestType, tid: Pid, signal: i32) -> Result<()> {
    // SAFETY: restart requests ignore `addr` and read `data` as a signal number.
    unsafe {
        raw_ptrace(request, tid, std::ptr::null_mut(), signal as usize as *mut c_void)
    }
    .died_if_esrch(tid)?;

    Ok(())
}

/// Read the regset `which` into `data`, returning the number of bytes the kernel filled.
///
/// The kernel chooses the layout from the tracee's current ABI, so the returned length
/// may be shorter than `size_of::<T>()`.
pub(crate) fn getregset<T>(tid: Pid, which: i32, data: &mut T) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: data as *mut T as *mut c_void,
        iov_len: mem::size_of::<T>(),
    };

    // SAFETY: `iov` describes a live, writable buffer of `size_of::<T>()` bytes, and
    // every `T` we read into is plain old data.
    unsafe {
        raw_ptrace(
            libc::PTRACE_GETREGSET as RequestType,
            tid,
            which as usize as *mut c_void,
            &mut iov as *mut libc::iovec as *mut c_void,
        )
    }
    .died_if_esrch(tid)?;

    Ok(iov.iov_len)
}

/// Write `data` to the regset `which`.
pub(crate) fn setregset<T>(tid: Pid, which: i32, data: &T) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: data as *const T as *mut c_void,
        iov_len: mem::size_of::<T>(),
    };

    // SAFETY: the kernel only reads from `iov_base` for `PTRACE_SETREGSET`.
    unsafe {
        raw_ptrace(
            libc::PTRACE_SETREGSET as RequestType,
            tid,
            which as usize as *mut c_void,
            &mut iov as *mut libc::iovec as *mut c_void,
        )
    }
    .died_if_esrch(tid)?;

    Ok(())
}

/// Send `signal` to the single thread `tid` of thread group `tgid`.
///
/// A zero `signal` only checks that the thread exists.
pub(crate) fn tgkill(tgid: Pid, tid: Pid, signal: i32) -> std::result::Result<(), Errno> {
    // SAFETY: `tgkill` takes three integer arguments and touches no memory.
    let res = unsafe {
        libc::syscall(libc::SYS_tgkill, tgid.as_raw(), tid.as_raw(), signal)
    };

    Errno::result(res).map(drop)
}

pub(crate) fn page_size() -> u64 {
    // SAFETY: `sysconf` has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size > 0 {
        size as u64
    } else {
        4096
    }
}

// Convert a failed `/proc` read for `pid` into a tracee-died error if the entry is gone.
pub(crate) fn proc_error(pid: Pid, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::TraceeDied { pid, source: Errno::ESRCH }
    } else {
        Error::IO(err)
    }
}

/// Look up the thread group id of `tid` via `/proc/<tid>/status`.
pub(crate) fn thread_group_id(tid: Pid) -> Result<Pid> {
    let path = format!("/proc/{}/status", tid.as_raw());
    let status = fs::read_to_string(path).map_err(|err| proc_error(tid, err))?;

    parse_tgid(&status)
        .ok_or_else(|| Error::Internal(format!("no `Tgid` field in status of {}", tid)))
}

fn parse_tgid(status: &str) -> Option<Pid> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Tgid:"))
        .and_then(|value| value.trim().parse().ok())
        .map(Pid::from_raw)
}

/// List the threads of the process `pid` via `/proc/<pid>/task`.
pub(crate) fn threads(pid: Pid) -> Result<Vec<Pid>> {
    let path = format!("/proc/{}/task", pid.as_raw());
    let mut tids = vec![];

    for entry in fs::read_dir(path).map_err(|err| proc_error(pid, err))? {
        let entry = entry?;

        if let Some(tid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            tids.push(Pid::from_raw(tid));
        }
    }

    tids.sort_by_key(|tid| tid.as_raw());

    Ok(tids)
}
