// SPDX-License-Identifier: Apache-2.0

//! Operator shell (C6): a whitespace-tokenized REPL over an [`EngineHandle`].

use std::io::{self, Write};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use colored::Colorize;
use taskmaster_runtime::{EngineEvent, EngineHandle, OperatorError, ReplicaState};

const PROMPT: &str = "taskmaster> ";

/// Drives the prompt loop until `exit`, EOF, or an externally triggered
/// shutdown. Also drains `events` so an out-of-band reload (SIGHUP or the
/// config file watcher) reprints the prompt instead of leaving the operator
/// staring at a stale line.
pub fn run(handle: EngineHandle, events: Receiver<EngineEvent>) {
    print_prompt();
    loop {
        match read_line() {
            None => {
                println!("\n[INFO] Exiting.");
                handle.shutdown();
                break;
            }
            Some(line) => {
                let line = line.trim();
                if line.is_empty() {
                    // Give the event drain a moment to reprint the prompt
                    // for any reload that landed while we were idle at it.
                    drain_events(&events);
                    print_prompt();
                    continue;
                }

                let mut parts = line.split_whitespace();
                let verb = parts.next().unwrap_or_default();
                let args: Vec<&str> = parts.collect();

                if verb == "exit" {
                    println!("Exiting.");
                    handle.shutdown();
                    break;
                }

                dispatch(&handle, verb, &args);
                drain_events(&events);
                print_prompt();
            }
        }
    }
}

fn dispatch(handle: &EngineHandle, verb: &str, args: &[&str]) {
    match verb {
        "start" => with_program_arg(args, verb, |name| handle.start(name)),
        "stop" => with_program_arg(args, verb, |name| handle.stop(name)),
        "restart" => with_program_arg(args, verb, |name| handle.restart(name)),
        "status" => print_status(handle),
        "reload" => match handle.reload() {
            Ok(()) => println!("{}", "reload complete".green()),
            Err(e) => println!("{} {e}", "!".red()),
        },
        "help" => print_help(),
        other => {
            print_error(&OperatorError::UnknownVerb(other.to_string()));
        }
    }
}

fn with_program_arg(args: &[&str], verb: &str, op: impl FnOnce(&str) -> Result<(), OperatorError>) {
    let Some(name) = args.first() else {
        print_error(&OperatorError::MissingArgument(format!("{verb} <name>")));
        return;
    };
    match op(name) {
        Ok(()) => println!("{} {verb} {name}", "✓".green()),
        Err(e) => print_error(&e),
    }
}

fn print_status(handle: &EngineHandle) {
    let snapshot = handle.status();
    for replica in snapshot.replicas {
        let line = match replica.state {
            ReplicaState::Running => format!("{}: RUNNING (pid={})", replica.key, replica.pid.unwrap_or(0)),
            ReplicaState::Fatal => match &replica.last_error {
                Some(err) => format!("{}: FATAL ({err})", replica.key),
                None => format!("{}: FATAL", replica.key),
            },
            other => format!("{}: {other}", replica.key),
        };
        println!("{line}");
    }
}

fn print_help() {
    println!("Commands: start <name>, stop <name>, restart <name>, status, reload, exit");
}

fn print_error(e: &OperatorError) {
    println!("{} {e}", "✗".red());
}

fn print_prompt() {
    print!("{PROMPT}");
    let _ = io::stdout().flush();
}

fn read_line() -> Option<String> {
    let mut buf = String::new();
    match io::stdin().read_line(&mut buf) {
        Ok(0) => None,
        Ok(_) => Some(buf),
        Err(_) => None,
    }
}

/// Drains any pending UI events without blocking; an externally triggered
/// reload prints a note so the operator knows the prompt was reprinted for
/// a reason other than their own input.
fn drain_events(events: &Receiver<EngineEvent>) {
    loop {
        match events.recv_timeout(Duration::from_millis(0)) {
            Ok(EngineEvent::ReloadCompleted {
                externally_triggered: true,
            }) => println!("[INFO] configuration reloaded"),
            Ok(EngineEvent::ReloadCompleted {
                externally_triggered: false,
            }) => {}
            Ok(EngineEvent::ShuttingDown) => {}
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
