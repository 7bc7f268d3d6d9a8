use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{
    sysno, Command, ExitAction, Hooks, SysCallEntryAction, SysCallExitAction, SysCallInfo,
    SysCallStatus, Tracee, TraceeState, Tracer,
};

#[macro_use]
mod support;
use support::*;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    SyncAtEntry,
    SyncAtExit,
    AsyncAtEntry,
    AsyncAtExit,
}

// Injects `getpid` once, at the first syscall stop of the right kind after the exec.
struct Injector {
    mode: Mode,
    recorder: Recorder,
    exec_done: bool,
    injected: bool,
    returned: Option<u64>,
    exit_code: Option<i32>,
}

impl Injector {
    fn new(mode: Mode) -> Self {
        Self {
            mode,
            recorder: Recorder::default(),
            exec_done: false,
            injected: false,
            returned: None,
            exit_code: None,
        }
    }

    fn getpid(info: &SysCallInfo) -> i64 {
        sysno::number(info.abi, "getpid").expect("no getpid")
    }

    fn armed(&self, info: &SysCallInfo) -> bool {
        self.exec_done && !self.injected && info.status == SysCallStatus::Normal
    }
}

impl Hooks for Injector {
    fn syscall_entry(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        self.recorder.syscall_entry(tracer, tracee, info);

        if !self.armed(info) {
            return SysCallEntryAction::Continue;
        }

        match self.mode {
            Mode::SyncAtEntry => {
                let original = *tracee.registers().expect("no registers");

                let ret = tracee
                    .inject_syscall(Self::getpid(info), [0; 6])
                    .expect("injection failed");
                self.returned = Some(ret);

                // Back at the entry of the tracee's own syscall.
                let regs = tracee.registers().expect("no registers");
                assert_eq!(tracee.state(), TraceeState::PreSysCallStop);
                assert_eq!(regs.ptrace_syscall(), original.ptrace_syscall());
                assert_eq!(regs.args(), original.args());
            }
            Mode::AsyncAtEntry => {
                tracee
                    .inject_syscall_async(Self::getpid(info), [0; 6])
                    .expect("injection failed");
                assert_eq!(tracee.syscall_status(), SysCallStatus::Injected);
            }
            _ => return SysCallEntryAction::Continue,
        }

        self.injected = true;

        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallExitAction {
        self.recorder.syscall_exit(tracer, tracee, info);

        if info.status == SysCallStatus::Injected {
            self.returned = info.return_value;
        }

        if info.is("execve") && info.result() == Some(Ok(0)) {
            self.exec_done = true;
            return SysCallExitAction::Continue;
        }

        if !self.armed(info) {
            return SysCallExitAction::Continue;
        }

        match self.mode {
            Mode::SyncAtExit => {
                let original = *tracee.registers().expect("no registers");

                let ret = tracee
                    .inject_syscall(Self::getpid(info), [0; 6])
                    .expect("injection failed");
                self.returned = Some(ret);

                // Back at the exit of the tracee's own syscall, unchanged.
                assert_eq!(tracee.state(), TraceeState::PostSysCallStop);
                assert_eq!(tracee.registers().ok(), Some(&original));
            }
            Mode::AsyncAtExit => {
                tracee
                    .inject_syscall_async(Self::getpid(info), [0; 6])
                    .expect("injection failed");
            }
            _ => return SysCallExitAction::Continue,
        }

        self.injected = true;

        SysCallExitAction::Continue
    }

    fn process_exited(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        self.exit_code = Some(code);
        self.recorder.process_exited(tracer, tracee, code)
    }
}

fn run_injector(mode: Mode) -> Result<(Tracer, Injector, systrace::Pid)> {
    let cmd = Command::new(&["true"])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut injector = Injector::new(mode);
    tracer.run(&mut injector)?;

    assert!(injector.injected);
    assert_eq!(injector.returned, Some(pid.as_raw() as u64));
    assert_eq!(injector.exit_code, Some(0));

    Ok((tracer, injector, pid))
}

// Syscall stops of `pid` after its exec.
fn after_exec(recorder: &Recorder, pid: systrace::Pid) -> Vec<Record> {
    let syscalls = recorder.syscalls(pid);
    let exec_exit = syscalls
        .iter()
        .position(|r| matches!(r, Record::Exit(_, Some("execve"), _)))
        .expect("no execve exit");

    syscalls[exec_exit + 1..].to_vec()
}

#[test]
#[timeout(2000)]
fn test_inject_sync_at_entry() -> Result<()> {
    let (_, injector, pid) = run_injector(Mode::SyncAtEntry)?;

    let syscalls = after_exec(&injector.recorder, pid);
    assert_alternating(&syscalls);

    // The injected syscall runs unseen by hooks.
    assert!(syscalls
        .iter()
        .all(|r| !matches!(r, Record::Entry(_, _, SysCallStatus::Injected))));

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_inject_sync_at_exit() -> Result<()> {
    let (_, injector, pid) = run_injector(Mode::SyncAtExit)?;

    let syscalls = after_exec(&injector.recorder, pid);
    assert_alternating(&syscalls);
    assert!(!syscalls
        .iter()
        .any(|r| matches!(r, Record::Exit(_, Some("getpid"), _))));

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_inject_async_at_entry() -> Result<()> {
    let (_, injector, pid) = run_injector(Mode::AsyncAtEntry)?;

    let syscalls = after_exec(&injector.recorder, pid);
    assert_alternating(&syscalls);

    let displaced = match syscalls[0] {
        Record::Entry(_, name, SysCallStatus::Normal) => name,
        record => panic!("unexpected first stop: {:?}", record),
    };

    assert_equivalent(
        &syscalls[..4],
        &[
            Record::Entry(pid!(0), displaced, SysCallStatus::Normal),
            Record::Exit(pid!(0), Some("getpid"), SysCallStatus::Injected),
            Record::Entry(pid!(0), displaced, SysCallStatus::Repeated),
            Record::Exit(pid!(0), displaced, SysCallStatus::Normal),
        ],
    );

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_inject_async_at_exit() -> Result<()> {
    let (_, injector, pid) = run_injector(Mode::AsyncAtExit)?;

    let syscalls = after_exec(&injector.recorder, pid);
    assert_alternating(&syscalls);

    let first = match syscalls[1] {
        Record::Exit(_, name, SysCallStatus::Normal) => name,
        record => panic!("unexpected first exit: {:?}", record),
    };

    assert_equivalent(
        &syscalls[..4],
        &[
            Record::Entry(pid!(0), first, SysCallStatus::Normal),
            Record::Exit(pid!(0), first, SysCallStatus::Normal),
            Record::Entry(pid!(0), Some("getpid"), SysCallStatus::Injected),
            Record::Exit(pid!(0), Some("getpid"), SysCallStatus::Injected),
        ],
    );
    assert!(matches!(
        syscalls[4],
        Record::Entry(_, _, SysCallStatus::Normal)
    ));

    eprintln!("ok!");

    Ok(())
}
