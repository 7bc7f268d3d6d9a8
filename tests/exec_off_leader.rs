#![cfg(feature = "test-programs")]

use std::io::{BufRead, BufReader, Write};
use std::process::{self, Stdio};

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{Command, Pid, Tracer};

#[macro_use]
mod support;
use support::*;

const EXEC_OFF_LEADER: &str = "test-programs/exec-off-leader/target/release/exec-off-leader";

// The index of the one `Disappeared` record, and its tid.
fn disappeared(records: &[Record]) -> (usize, Pid) {
    let disappeared: Vec<_> = records
        .iter()
        .enumerate()
        .filter_map(|(i, record)| match record {
            Record::Disappeared(tid) => Some((i, *tid)),
            _ => None,
        })
        .collect();
    assert_eq!(disappeared.len(), 1);

    disappeared[0]
}

#[test]
#[timeout(3000)]
fn test_exec_off_leader() -> Result<()> {
    let cmd = Command::new(&[EXEC_OFF_LEADER])?;
    let mut tracer = Tracer::new();
    let pid = tracer.spawn(cmd)?;

    let mut recorder = Recorder::default();
    tracer.run(&mut recorder)?;

    assert!(tracer.is_empty());

    // The leader, two sleepers, and the exec thread.
    let tids = recorder.tids();
    eprintln!("tids: {:?}", tids);
    assert_eq!(tids.len(), 4);
    assert_eq!(tids[0], pid);

    // The exec thread takes over the leader's tid, and is never heard of again.
    let (index, exec_tid) = disappeared(&recorder.records);
    assert_ne!(exec_tid, pid);
    assert!(recorder.records[index + 1..]
        .iter()
        .all(|record| record.tid() != exec_tid));

    // Only the sleepers are reported dead, once each. Depending on the kernel, a thread
    // zapped by an exec is reported as exited or as killed.
    let exits = recorder.exits();
    let sleepers: Vec<Pid> = tids
        .iter()
        .copied()
        .filter(|tid| *tid != pid && *tid != exec_tid)
        .collect();
    assert_eq!(sleepers.len(), 2);

    for sleeper in &sleepers {
        let count = exits.iter().filter(|r| r.tid() == *sleeper).count();
        assert_eq!(count, 1, "exits of {}: {:?}", sleeper, exits);
    }
    assert!(exits.iter().all(|r| r.tid() != exec_tid));

    // The replaced leader reports no exit, and the new program exits cleanly as the leader.
    let leader_exits: Vec<_> = exits.iter().filter(|r| r.tid() == pid).copied().collect();
    assert_eq!(leader_exits, vec![Record::Exited(pid, 0)]);
    assert_eq!(recorder.records.last(), Some(&Record::Exited(pid, 0)));
    assert!(recorder.records[index + 1..]
        .iter()
        .any(|record| matches!(record, Record::Entry(tid, ..) if *tid == pid)));

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(3000)]
fn test_exec_off_untraced_leader() -> Result<()> {
    let mut child = process::Command::new(EXEC_OFF_LEADER)
        .arg("--wait")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let pid = pid!(child.id() as i32);

    let mut line = String::new();
    let stdout = child.stdout.take().expect("no stdout");
    BufReader::new(stdout).read_line(&mut line)?;
    let exec_tid = pid!(line.trim().parse()?);
    assert_ne!(exec_tid, pid);

    // Trace only the exec thread.
    let mut tracer = Tracer::new();
    tracer.attach(exec_tid)?;

    let mut stdin = child.stdin.take().expect("no stdin");
    writeln!(stdin, "go")?;
    drop(stdin);

    let mut recorder = Recorder::default();
    tracer.run(&mut recorder)?;

    assert!(tracer.is_empty());
    assert_eq!(recorder.tids(), vec![exec_tid, pid]);

    // The leader is first seen when the exec thread takes over its tid.
    let (index, tid) = disappeared(&recorder.records);
    assert_eq!(tid, exec_tid);
    assert_eq!(recorder.records.get(index + 1), Some(&Record::Created(pid)));

    assert_eq!(recorder.exits(), vec![Record::Exited(pid, 0)]);

    eprintln!("ok!");

    Ok(())
}
