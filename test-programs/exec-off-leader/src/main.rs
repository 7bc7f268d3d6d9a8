use std::io::{self, BufRead, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread::{sleep, spawn};
use std::time::Duration;

// Exec from a thread other than the thread group leader, while other threads are alive.
//
// With `--wait`, the exec thread prints its tid and waits for a line on stdin first.
fn main() {
    let wait = std::env::args().any(|arg| arg == "--wait");

    for _ in 0..2 {
        spawn(|| sleep(Duration::from_secs(60)));
    }

    // Let the sleepers start.
    sleep(Duration::from_millis(100));

    let err = spawn(move || {
        if wait {
            if let Err(err) = announce_and_wait() {
                return err;
            }
        }

        Command::new("/bin/true").exec()
    })
    .join()
    .expect("exec thread panicked");

    eprintln!("exec failed: {}", err);
    std::process::exit(1);
}

fn announce_and_wait() -> io::Result<()> {
    // `/proc/thread-self` links to `<pid>/task/<tid>`.
    let link = std::fs::read_link("/proc/thread-self")?;
    let tid = link
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_owned();

    let mut stdout = io::stdout();
    writeln!(stdout, "{}", tid)?;
    stdout.flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    Ok(())
}
