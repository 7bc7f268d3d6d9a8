use std::thread;
use std::time::Duration;

use anyhow::Result;
use nix::sys::signal::{self, Signal};
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{
    sysno, Command, ExitAction, GroupStopAction, Hooks, SignalAction, SysCallEntryAction,
    SysCallExitAction, SysCallInfo, SysCallStatus, Tracee, Tracer,
};

#[macro_use]
mod support;
use support::*;

// Leaves group-stopped tracees stopped, and continues them from another thread.
#[derive(Default)]
struct Continuer {
    recorder: Recorder,
}

impl Hooks for Continuer {
    fn group_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> GroupStopAction {
        let action = self.recorder.group_stop(tracer, tracee, signal);
        assert_eq!(action, GroupStopAction::Acknowledge);

        let tgid = tracee.tgid();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            // Fails harmlessly if the process is already gone.
            if let Err(errno) = signal::kill(tgid, Signal::SIGCONT) {
                eprintln!("{}: unable to send SIGCONT: {}", tgid, errno);
            }
        });

        action
    }

    fn signal_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        self.recorder.signal_stop(tracer, tracee, signal)
    }

    fn process_exited(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        self.recorder.process_exited(tracer, tracee, code)
    }
}

#[test]
#[timeout(3000)]
fn test_group_stop_acknowledged() -> Result<()> {
    let cmd = Command::new(&["sh", "-c", "kill -STOP $$; exit 0"])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut hooks = Continuer::default();
    tracer.run(&mut hooks)?;

    let records = &hooks.recorder.records;
    // The spawned child may also report the stop it was seized in.
    let stop = records
        .iter()
        .rposition(|r| *r == Record::Group(pid, libc::SIGSTOP))
        .expect("no group-stop");

    // The stopping signal raised by the shell is delivered first.
    assert!(records[..stop].contains(&Record::Signal(pid, libc::SIGSTOP)));

    // The process waits out the group-stop, and then exits normally.
    assert_eq!(hooks.recorder.exits(), vec![Record::Exited(pid, 0)]);
    assert!(tracer.is_empty());

    eprintln!("ok!");

    Ok(())
}

// Discards every SIGUSR1.
#[derive(Default)]
struct Ignorer {
    recorder: Recorder,
}

impl Hooks for Ignorer {
    fn signal_stop(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        self.recorder.signal_stop(tracer, tracee, signal);

        if signal == libc::SIGUSR1 {
            SignalAction::Suppress
        } else {
            SignalAction::Forward
        }
    }

    fn process_exited(&mut self, tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        self.recorder.process_exited(tracer, tracee, code)
    }

    fn process_killed(
        &mut self,
        tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
        core_dumped: bool,
    ) -> ExitAction {
        self.recorder.process_killed(tracer, tracee, signal, core_dumped)
    }
}

const RAISE_SIGUSR1: &[&str] = &["sh", "-c", "kill -USR1 $$; exit 0"];

#[test]
#[timeout(2000)]
fn test_signal_forwarded() -> Result<()> {
    let cmd = Command::new(RAISE_SIGUSR1)?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut recorder = Recorder::default();
    tracer.run(&mut recorder)?;

    assert!(recorder.records.contains(&Record::Signal(pid, libc::SIGUSR1)));
    assert_eq!(recorder.exits(), vec![Record::Killed(pid, libc::SIGUSR1)]);

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_signal_suppressed() -> Result<()> {
    let cmd = Command::new(RAISE_SIGUSR1)?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut hooks = Ignorer::default();
    tracer.run(&mut hooks)?;

    assert!(hooks.recorder.records.contains(&Record::Signal(pid, libc::SIGUSR1)));
    assert_eq!(hooks.recorder.exits(), vec![Record::Exited(pid, 0)]);

    eprintln!("ok!");

    Ok(())
}

// Signals its tracee, then injects `getpid` synchronously, at the first syscall after the
// exec.
#[derive(Default)]
struct SignalDuringInjection {
    exec_done: bool,
    returned: Option<u64>,

    // SIGUSR1 stops seen, and whether the injection had returned by then.
    signals: Vec<(i32, bool)>,
    exit_code: Option<i32>,
}

impl Hooks for SignalDuringInjection {
    fn syscall_entry(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        if !self.exec_done || self.returned.is_some() || info.status != SysCallStatus::Normal {
            return SysCallEntryAction::Continue;
        }

        signal::kill(tracee.tgid(), Signal::SIGUSR1).expect("unable to send SIGUSR1");

        let getpid = sysno::number(info.abi, "getpid").expect("no getpid");
        let ret = tracee.inject_syscall(getpid, [0; 6]).expect("injection failed");
        self.returned = Some(ret);

        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        _tracer: &mut Tracer,
        _tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallExitAction {
        if info.is("execve") && info.result() == Some(Ok(0)) {
            self.exec_done = true;
        }

        SysCallExitAction::Continue
    }

    fn signal_stop(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        eprintln!("{}: signal {}", tracee.tid(), signal);

        if signal != libc::SIGUSR1 {
            return SignalAction::Forward;
        }

        self.signals.push((signal, self.returned.is_some()));

        SignalAction::Suppress
    }

    fn process_exited(&mut self, _tracer: &mut Tracer, _tracee: &mut Tracee, code: i32) -> ExitAction {
        self.exit_code = Some(code);
        ExitAction::Remove
    }
}

#[test]
#[timeout(2000)]
fn test_signal_held_back_during_injection() -> Result<()> {
    let cmd = Command::new(&["true"])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut hooks = SignalDuringInjection::default();
    tracer.run(&mut hooks)?;

    assert_eq!(hooks.returned, Some(pid.as_raw() as u64));

    // Delivered once, after the injection.
    assert_eq!(hooks.signals, vec![(libc::SIGUSR1, true)]);
    assert_eq!(hooks.exit_code, Some(0));

    eprintln!("ok!");

    Ok(())
}
