use std::collections::BTreeMap;

use anyhow::Result;
use structopt::StructOpt;
use systrace::{
    Command, ExitAction, Hooks, Pid, SignalAction, SysCallEntryAction, SysCallExitAction,
    SysCallInfo, Tracee, Tracer,
};
use tracing_subscriber::EnvFilter;

#[derive(StructOpt, Debug)]
struct Opt {
    /// Attach to a running process instead of spawning one.
    #[structopt(short, long)]
    pid: Option<i32>,

    /// Make these syscalls fail with `EPERM`, without running them.
    #[structopt(short, long)]
    deny: Vec<String>,

    /// Log tracer internals, filtered by `RUST_LOG`.
    #[structopt(short, long)]
    verbose: bool,

    argv: Vec<String>,
}

// Syscalls whose first argument is a path.
const PATH_SYSCALLS: &[&str] = &["open", "stat", "lstat", "access", "execve", "mkdir", "unlink"];

// Syscalls whose second argument is a path.
const PATH_AT_SYSCALLS: &[&str] = &["openat", "newfstatat", "faccessat", "mkdirat", "unlinkat"];

#[derive(Default)]
struct Strace {
    deny: Vec<String>,

    // Formatted entries, by tid, awaiting their return values.
    entries: BTreeMap<Pid, String>,
}

impl Strace {
    fn format_entry(tracee: &Tracee, info: &SysCallInfo) -> String {
        let name = info.name.map(String::from).unwrap_or_else(|| format!("syscall_{}", info.number));

        let path_arg = if PATH_SYSCALLS.iter().any(|s| info.is(s)) {
            Some(0)
        } else if PATH_AT_SYSCALLS.iter().any(|s| info.is(s)) {
            Some(1)
        } else {
            None
        };

        let args: Vec<String> = info
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| match path_arg {
                Some(index) if index == i => match tracee.read_string(*arg) {
                    Ok(path) => format!("{:?}", String::from_utf8_lossy(&path)),
                    Err(_) => format!("{:#x}", arg),
                },
                _ => format!("{:#x}", arg),
            })
            .collect();

        format!("{}({})", name, args.join(", "))
    }
}

impl Hooks for Strace {
    fn syscall_entry(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        let entry = Self::format_entry(tracee, info);
        self.entries.insert(tracee.tid(), entry);

        if self.deny.iter().any(|name| info.is(name)) {
            return SysCallEntryAction::Suppress(-(libc::EPERM as i64) as u64);
        }

        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallExitAction {
        let entry = self
            .entries
            .remove(&tracee.tid())
            .unwrap_or_else(|| Self::format_entry(tracee, info));

        let ret = match info.result() {
            Some(Ok(value)) => format!("{:#x}", value),
            Some(Err(errno)) => format!("-1 {}", errno),
            None => "?".into(),
        };

        println!("[{}] {} = {}", tracee.tid(), entry, ret);

        SysCallExitAction::Continue
    }

    fn signal_stop(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        println!("[{}] --- signal {} ---", tracee.tid(), signal);
        SignalAction::Forward
    }

    fn process_exited(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        if let Some(entry) = self.entries.remove(&tracee.tid()) {
            println!("[{}] {} = ?", tracee.tid(), entry);
        }

        println!("[{}] +++ exited with {} +++", tracee.tid(), code);
        ExitAction::Remove
    }

    fn process_killed(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
        core_dumped: bool,
    ) -> ExitAction {
        let core = if core_dumped { " (core dumped)" } else { "" };
        println!("[{}] +++ killed by signal {}{} +++", tracee.tid(), signal, core);
        ExitAction::Remove
    }
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    if opt.verbose {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let mut tracer = Tracer::new();

    match opt.pid {
        Some(pid) => {
            tracer.attach_process(Pid::from_raw(pid))?;
        }
        None => {
            let cmd = Command::new(&opt.argv)?;
            tracer.spawn(cmd)?;
        }
    }

    let mut strace = Strace {
        deny: opt.deny,
        ..Strace::default()
    };

    tracer.run(&mut strace)?;

    Ok(())
}
