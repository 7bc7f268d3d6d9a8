use std::io;

use nix::errno::Errno;

use crate::tracee::TraceeState;
use crate::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Tracee died while processing request, pid = {pid}")]
    TraceeDied {
        pid: Pid,
        source: Errno,
    },

    #[error("Tracee = {tid} cannot {op} while in state {state:?}")]
    InvalidState {
        tid: Pid,
        state: TraceeState,
        op: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied for tracee = {pid}")]
    PermissionDenied {
        pid: Pid,
        source: Errno,
    },

    #[error("Memory fault at address {addr:#x}")]
    MemoryFault {
        addr: u64,
    },

    #[error("Address range overflow: {addr:#x} + {len}")]
    Overflow {
        addr: u64,
        len: usize,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Wait was interrupted")]
    Interrupted,

    #[error("Remote syscall `{name}` failed")]
    RemoteSyscall {
        name: &'static str,
        source: Errno,
    },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`].
///
/// `NotFound` and `Interrupted` are expected, transient conditions. Everything else
/// should be surfaced to whoever drives the trace session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    PermissionDenied,
    MemoryFault,
    Overflow,
    Unsupported,
    Interrupted,
    Other,
}

impl ErrorKind {
    fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ESRCH | Errno::ECHILD => ErrorKind::NotFound,
            Errno::EINVAL => ErrorKind::InvalidArgument,
            Errno::EPERM | Errno::EACCES => ErrorKind::PermissionDenied,
            Errno::EFAULT | Errno::EIO => ErrorKind::MemoryFault,
            Errno::EOVERFLOW => ErrorKind::Overflow,
            Errno::ENOSYS => ErrorKind::Unsupported,
            Errno::EINTR => ErrorKind::Interrupted,
            _ => ErrorKind::Other,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TraceeDied { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::MemoryFault { .. } => ErrorKind::MemoryFault,
            Error::Overflow { .. } => ErrorKind::Overflow,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Interrupted => ErrorKind::Interrupted,
            Error::RemoteSyscall { source, .. } => ErrorKind::from_errno(*source),
            Error::OS(errno) => ErrorKind::from_errno(*errno),
            Error::IO(err) => match err.raw_os_error() {
                Some(raw) => ErrorKind::from_errno(Errno::from_i32(raw)),
                None => ErrorKind::Other,
            },
            Error::Internal(_) => ErrorKind::Other,
        }
    }

    /// True if the error was caused by the tracee exiting or being killed.
    ///
    /// A death event for the tracee will be reported by a later wait.
    pub fn tracee_died(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Classify `source`, returned by a request targeting `pid`.
    pub(crate) fn for_tracee(pid: Pid, source: Errno) -> Self {
        match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            Errno::EPERM => Error::PermissionDenied { pid, source },
            errno => Error::OS(errno),
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` and `EPERM` from a request targeting `pid` into their taxonomy variants.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, Errno> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| Error::for_tracee(pid, source))
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
