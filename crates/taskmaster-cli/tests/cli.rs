// SPDX-License-Identifier: Apache-2.0

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

fn taskmaster(config_path: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_taskmaster"));
    cmd.arg(config_path).arg("--no-banner");
    cmd
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Session {
    fn spawn(config_path: &std::path::Path) -> Session {
        let mut child = taskmaster(config_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn taskmaster");
        let stdin = child.stdin.take().unwrap();
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Session { child, stdin, stdout }
    }

    fn send(&mut self, line: &str) {
        writeln!(self.stdin, "{line}").unwrap();
    }

    /// Reads lines until `needle` is found or a short timeout elapses,
    /// returning everything read.
    fn read_until(&mut self, needle: &str) -> String {
        let mut collected = String::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut line = String::new();
        while std::time::Instant::now() < deadline {
            line.clear();
            match self.stdout.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    collected.push_str(&line);
                    if collected.contains(needle) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        collected
    }

    fn status(&mut self) -> String {
        self.send("status");
        // status lines are followed by a fresh prompt; read until we see it.
        self.read_until("taskmaster> ")
    }

    fn exit(mut self) {
        self.send("exit");
        let _ = self.child.wait_timeout_or_kill();
    }
}

trait WaitTimeoutOrKill {
    fn wait_timeout_or_kill(&mut self) -> std::io::Result<()>;
}

impl WaitTimeoutOrKill for Child {
    fn wait_timeout_or_kill(&mut self) -> std::io::Result<()> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(Some(_)) = self.try_wait() {
                return Ok(());
            }
            if std::time::Instant::now() >= deadline {
                let _ = self.kill();
                let _ = self.wait();
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

fn write_config(tmp: &std::path::Path, yaml: &str) -> std::path::PathBuf {
    let path = tmp.join("taskmaster.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn autostart_then_clean_exit_reaches_exited() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  quick:\n    cmd: /bin/true\n    autostart: true\n    autorestart: never\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_millis(500));
    let status = session.status();
    assert!(status.contains("quick:0: EXITED"), "status was:\n{status}");
    session.exit();
}

#[test]
fn flapping_start_exhausts_retries_and_goes_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  bad:\n    cmd: /bin/false\n    autostart: true\n    autorestart: unexpected\n    startretries: 2\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_secs(3));
    let status = session.status();
    assert!(status.contains("bad:0: FATAL"), "status was:\n{status}");
    session.exit();
}

#[test]
fn successful_start_then_crash_restarts_under_unexpected_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  flaky:\n    cmd: /bin/sh -c 'sleep 0.3'\n    autostart: true\n    autorestart: unexpected\n    startsecs: 0\n    startretries: 5\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_millis(200));
    let first = session.status();
    assert!(first.contains("flaky:0: RUNNING"), "status was:\n{first}");
    std::thread::sleep(Duration::from_millis(700));
    let second = session.status();
    assert!(second.contains("flaky:0: RUNNING"), "status was:\n{second}");
    session.exit();
}

#[test]
fn stop_escalates_to_kill_after_stoptime() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  stubborn:\n    cmd: /bin/sh -c 'trap \"\" TERM; sleep 30'\n    autostart: true\n    stoptime: 1\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_millis(300));
    let before = session.status();
    assert!(before.contains("stubborn:0: RUNNING"), "status was:\n{before}");

    session.send("stop stubborn");
    let reply = session.read_until("taskmaster> ");
    assert!(reply.contains("stop stubborn"), "reply was:\n{reply}");

    let after = session.status();
    assert!(after.contains("stubborn:0: STOPPED"), "status was:\n{after}");
    session.exit();
}

#[test]
fn reload_adds_and_removes_programs() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  keep:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n  gone:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_millis(300));

    std::fs::write(
        &config,
        "programs:\n  keep:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n  fresh:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n",
    )
    .unwrap();

    session.send("reload");
    let reply = session.read_until("taskmaster> ");
    assert!(reply.contains("reload complete"), "reply was:\n{reply}");

    std::thread::sleep(Duration::from_millis(300));
    let status = session.status();
    assert!(status.contains("keep:0: RUNNING"), "status was:\n{status}");
    assert!(status.contains("fresh:0: RUNNING"), "status was:\n{status}");
    assert!(!status.contains("gone:0"), "status was:\n{status}");
    session.exit();
}

#[test]
fn numprocs_shrink_stops_trailing_replicas() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(
        &tmp,
        "programs:\n  pool:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n    numprocs: 3\n",
    );
    let mut session = Session::spawn(&config);
    std::thread::sleep(Duration::from_millis(300));
    let before = session.status();
    assert!(before.contains("pool:2: RUNNING"), "status was:\n{before}");

    std::fs::write(
        &config,
        "programs:\n  pool:\n    cmd: /bin/sh -c 'sleep 30'\n    autostart: true\n    numprocs: 1\n",
    )
    .unwrap();
    session.send("reload");
    session.read_until("taskmaster> ");

    std::thread::sleep(Duration::from_millis(300));
    let after = session.status();
    assert!(after.contains("pool:0: RUNNING"), "status was:\n{after}");
    assert!(!after.contains("pool:1"), "status was:\n{after}");
    assert!(!after.contains("pool:2"), "status was:\n{after}");
    session.exit();
}

#[test]
fn unknown_program_reports_operator_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(&tmp, "programs:\n  solo:\n    cmd: /bin/true\n");
    let mut session = Session::spawn(&config);
    session.send("start nosuch");
    let reply = session.read_until("taskmaster> ");
    assert!(reply.contains("unknown program"), "reply was:\n{reply}");
    session.exit();
}

#[test]
fn help_lists_verbs() {
    let tmp = tempfile::tempdir().unwrap();
    let config = write_config(&tmp, "programs:\n  solo:\n    cmd: /bin/true\n");
    let mut session = Session::spawn(&config);
    session.send("help");
    let reply = session.read_until("taskmaster> ");
    assert!(reply.contains("start <name>"), "reply was:\n{reply}");
    session.exit();
}

#[test]
fn bad_config_path_exits_with_code_two() {
    let status = taskmaster(std::path::Path::new("/no/such/taskmaster.yaml"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("failed to run taskmaster");
    assert_eq!(status.code(), Some(2));
}
