use std::env;
use std::ffi::{CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{fork, ForkResult};

use crate::error::{Error, Result};
use crate::Pid;

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(argv: impl IntoIterator<Item = S>) -> Result<Self> {
        // Ensure we own NUL-terminated strings for the foreign exec call.
        let argv = argv
            .into_iter()
            .map(|arg| CString::new(arg.as_ref().as_bytes()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        if argv.is_empty() {
            return Err(Error::InvalidArgument("command requires a program".into()));
        }

        Ok(Self { argv })
    }

    pub fn program(&self) -> &OsStr {
        OsStr::from_bytes(self.argv[0].as_bytes())
    }

    /// Fork and exec a child process determined by `self.argv`.
    ///
    /// The child raises `SIGSTOP` before exec, so the parent can seize and resume it
    /// without missing any of its events.
    pub(crate) fn fork_exec(self) -> Result<Pid> {
        // Heap-allocates, must occur pre-fork.
        let path = self.resolve()?;
        let argv = self.argv();

        // SAFETY: the child only makes async-signal-safe calls before exec or exit.
        match unsafe { fork() }? {
            ForkResult::Child => {
                // Use the raw libc calls, because the `nix` wrappers may heap-allocate,
                // which is not async-signal-safe.
                unsafe {
                    if libc::raise(libc::SIGSTOP) != 0 {
                        libc::_exit(126);
                    }

                    libc::execv(path.as_ptr(), argv.as_ptr());

                    libc::_exit(127);
                }
            }
            ForkResult::Parent { child } => Ok(child),
        }
    }

    // Find the program to exec, looking through `PATH` for bare names.
    fn resolve(&self) -> Result<CString> {
        let program = Path::new(self.program());

        if program.as_os_str().as_bytes().contains(&b'/') {
            return Ok(self.argv[0].clone());
        }

        let paths = env::var_os("PATH").unwrap_or_default();

        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .and_then(|found: PathBuf| CString::new(found.into_os_string().as_bytes()).ok())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("command not found: {}", program.display()))
            })
    }

    // Construct NUL-terminated arguments for `execv`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        argv
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
