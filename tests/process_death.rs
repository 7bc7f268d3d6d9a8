use anyhow::Result;
use nix::sys::signal::{self, Signal};
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{
    Command, Hooks, SysCallEntryAction, SysCallInfo, SysCallStatus, Tracee, Tracer,
};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(2000)]
fn test_kill_sigtrap() -> Result<()> {
    let cmd = Command::new(&["sleep", "60"])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    signal::kill(pid, Signal::SIGTRAP)?;

    let mut recorder = Recorder::default();
    tracer.run(&mut recorder)?;

    assert!(recorder.records.contains(&Record::Signal(pid, libc::SIGTRAP)));
    assert_equivalent(&recorder.exits(), &[Record::Killed(pid!(0), libc::SIGTRAP)]);
    assert!(tracer.is_empty());

    eprintln!("ok!");

    Ok(())
}

// Kills its tracee at the first syscall after the exec.
#[derive(Default)]
struct KillAfterExec {
    recorder: Recorder,
    exec_done: bool,
}

impl Hooks for KillAfterExec {
    fn syscall_entry(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        self.recorder.syscall_entry(tracer, tracee, info);

        if self.exec_done {
            return SysCallEntryAction::Kill;
        }

        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> systrace::SysCallExitAction {
        if info.is("execve") && info.result() == Some(Ok(0)) {
            self.exec_done = true;
        }

        self.recorder.syscall_exit(tracer, tracee, info)
    }

    fn process_killed(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
        core_dumped: bool,
    ) -> systrace::ExitAction {
        self.recorder.process_killed(tracer, tracee, signal, core_dumped)
    }
}

#[test]
#[timeout(2000)]
fn test_kill_from_hook() -> Result<()> {
    let cmd = Command::new(&["sleep", "60"])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut hooks = KillAfterExec::default();
    tracer.run(&mut hooks)?;

    assert!(hooks.exec_done);
    assert_eq!(hooks.recorder.exits(), vec![Record::Killed(pid, libc::SIGKILL)]);

    // The killed syscall was entered, and never exited.
    let syscalls = hooks.recorder.syscalls(pid);
    assert!(matches!(
        syscalls.last(),
        Some(Record::Entry(_, _, SysCallStatus::Normal))
    ));

    eprintln!("ok!");

    Ok(())
}
