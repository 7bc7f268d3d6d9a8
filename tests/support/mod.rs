use std::collections::HashMap;
use std::convert::TryInto;

use pretty_assertions::assert_eq;
use systrace::{
    ExitAction, ExitStopAction, GroupStopAction, Hooks, InterruptAction, Pid, SignalAction,
    SysCallEntryAction, SysCallExitAction, SysCallInfo, SysCallStatus, Tracee, Tracer,
};

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        systrace::Pid::from_raw($raw)
    };
}

/// A hook invocation, as seen by a [`Recorder`].
#[allow(unused)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Record {
    Created(Pid),
    Disappeared(Pid),
    Exited(Pid, i32),
    Killed(Pid, i32),
    Entry(Pid, Option<&'static str>, SysCallStatus),
    Exit(Pid, Option<&'static str>, SysCallStatus),
    Signal(Pid, i32),
    Group(Pid, i32),
    Interrupt(Pid, i32),
    Exiting(Pid, i32),
}

#[allow(unused)]
impl Record {
    pub fn tid(&self) -> Pid {
        use Record::*;

        match *self {
            Created(tid)
            | Disappeared(tid)
            | Exited(tid, _)
            | Killed(tid, _)
            | Entry(tid, ..)
            | Exit(tid, ..)
            | Signal(tid, _)
            | Group(tid, _)
            | Interrupt(tid, _)
            | Exiting(tid, _) => tid,
        }
    }

    fn with_tid(self, tid: Pid) -> Self {
        use Record::*;

        match self {
            Created(_) => Created(tid),
            Disappeared(_) => Disappeared(tid),
            Exited(_, code) => Exited(tid, code),
            Killed(_, signal) => Killed(tid, signal),
            Entry(_, name, status) => Entry(tid, name, status),
            Exit(_, name, status) => Exit(tid, name, status),
            Signal(_, signal) => Signal(tid, signal),
            Group(_, signal) => Group(tid, signal),
            Interrupt(_, signal) => Interrupt(tid, signal),
            Exiting(_, status) => Exiting(tid, status),
        }
    }

    pub fn is_syscall(&self) -> bool {
        matches!(self, Record::Entry(..) | Record::Exit(..))
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Record::Created(_) | Record::Disappeared(_) | Record::Exited(..) | Record::Killed(..)
        )
    }
}

/// Hooks that record every invocation, and otherwise keep the default actions.
#[derive(Default)]
pub struct Recorder {
    pub records: Vec<Record>,
}

#[allow(unused)]
impl Recorder {
    pub fn record(&mut self, record: Record) {
        eprintln!("{:?}", record);
        self.records.push(record);
    }

    pub fn syscalls(&self, tid: Pid) -> Vec<Record> {
        self.records
            .iter()
            .filter(|r| r.is_syscall() && r.tid() == tid)
            .copied()
            .collect()
    }

    pub fn lifecycle(&self) -> Vec<Record> {
        self.records.iter().filter(|r| r.is_lifecycle()).copied().collect()
    }

    pub fn exits(&self) -> Vec<Record> {
        self.records
            .iter()
            .filter(|r| matches!(r, Record::Exited(..) | Record::Killed(..)))
            .copied()
            .collect()
    }

    /// Every thread id seen, in order of first appearance.
    pub fn tids(&self) -> Vec<Pid> {
        let mut tids = vec![];

        for record in &self.records {
            if !tids.contains(&record.tid()) {
                tids.push(record.tid());
            }
        }

        tids
    }
}

impl Hooks for Recorder {
    fn tracee_created(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee) {
        self.record(Record::Created(tracee.tid()));
    }

    fn tracee_disappeared(&mut self, _tracer: &mut Tracer, tid: Pid) {
        self.record(Record::Disappeared(tid));
    }

    fn process_exited(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, code: i32) -> ExitAction {
        self.record(Record::Exited(tracee.tid(), code));
        ExitAction::Remove
    }

    fn process_killed(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
        _core_dumped: bool,
    ) -> ExitAction {
        self.record(Record::Killed(tracee.tid(), signal));
        ExitAction::Remove
    }

    fn syscall_entry(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallEntryAction {
        self.record(Record::Entry(tracee.tid(), info.name, info.status));
        SysCallEntryAction::Continue
    }

    fn syscall_exit(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        info: &SysCallInfo,
    ) -> SysCallExitAction {
        self.record(Record::Exit(tracee.tid(), info.name, info.status));
        SysCallExitAction::Continue
    }

    fn signal_stop(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> SignalAction {
        self.record(Record::Signal(tracee.tid(), signal));
        SignalAction::Forward
    }

    fn group_stop(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, signal: i32) -> GroupStopAction {
        self.record(Record::Group(tracee.tid(), signal));
        GroupStopAction::Acknowledge
    }

    fn interrupt_stop(
        &mut self,
        _tracer: &mut Tracer,
        tracee: &mut Tracee,
        signal: i32,
    ) -> InterruptAction {
        self.record(Record::Interrupt(tracee.tid(), signal));
        InterruptAction::Continue
    }

    fn exit_stop(&mut self, _tracer: &mut Tracer, tracee: &mut Tracee, status: i32) -> ExitStopAction {
        self.record(Record::Exiting(tracee.tid(), status));
        ExitStopAction::Continue
    }
}

/// Assert that syscall entries and exits of one thread alternate, starting with an entry.
#[allow(unused)]
pub fn assert_alternating(syscalls: &[Record]) {
    let mut expect_entry = true;

    for record in syscalls {
        match record {
            Record::Entry(..) => assert!(expect_entry, "two entries in a row: {:?}", syscalls),
            Record::Exit(..) => assert!(!expect_entry, "exit without entry: {:?}", syscalls),
            _ => panic!("not a syscall record: {:?}", record),
        }

        expect_entry = !expect_entry;
    }
}

/// Assert that two record traces are equivalent modulo PID normalization.
#[allow(unused)]
pub fn assert_equivalent(left: &[Record], right: &[Record]) {
    let normed_left = Normalizer::normalize(left);
    let normed_right = Normalizer::normalize(right);
    assert_eq!(normed_left, normed_right)
}

/// Normalizes a record trace by substituting each concrete raw PID value with one that
/// matches its ordinal of appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<Pid, Pid>,
}

impl Normalizer {
    pub fn normalize(trace: &[Record]) -> Vec<Record> {
        let mut normalizer = Normalizer::default();

        trace
            .iter()
            .map(|record| record.with_tid(normalizer.normalize_pid(record.tid())))
            .collect()
    }

    fn normalize_pid(&mut self, pid: Pid) -> Pid {
        // Avoid borrowck error in `default` fn.
        let next_free = self.map.len();

        let entry = self.map.entry(pid).or_insert_with(|| {
            let raw: i32 = next_free.try_into().expect("exhausted free test PIDs");
            Pid::from_raw(raw)
        });

        *entry
    }
}
