// SPDX-License-Identifier: Apache-2.0

//! Supervisor engine: owns the replica table, drives the monitoring loop,
//! and serves the operations the operator shell and signal handler inject
//! through a serialized command queue.
//!
//! The engine thread itself never blocks on spawning or on a `startsecs` /
//! `stoptime` wait. Those waits happen on
//! short-lived helper threads — one "starter" per spawn attempt, one
//! "watcher" per live child, one "stopper" per in-flight stop — that report
//! their outcome back onto the same command queue, tagged with the
//! replica's generation so a stale report from a since-replaced child is
//! ignored.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, FatalReplica, OperatorError, StopTimeout};
use crate::launcher::{self, ChildHandle};
use crate::replica::{should_restart, ReplicaKey, ReplicaState};

const BACKOFF_DELAY: Duration = Duration::from_secs(1);
const COMMAND_QUEUE_DEPTH: usize = 256;
/// Upper bound on how long the engine thread ever blocks in one iteration
/// of its own loop; the monitor/tick responsibility piggybacks on this.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

type Reply<T> = mpsc::Sender<T>;

/// One entry in the operator-visible status snapshot.
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub key: ReplicaKey,
    pub state: ReplicaState,
    pub pid: Option<u32>,
    /// Set once a replica is parked in `Fatal`; carries the
    /// [`FatalReplica`] message for `status` to surface.
    pub last_error: Option<String>,
}

/// Snapshot returned by `status()`.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub replicas: Vec<ReplicaStatus>,
}

/// Events the engine pushes out for UI purposes (e.g. reprinting the
/// operator prompt after a reload triggered by SIGHUP or the file watcher,
/// as opposed to one typed at the prompt).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ReloadCompleted { externally_triggered: bool },
    ShuttingDown,
}

enum Command {
    Start {
        program: String,
        reply: Reply<Result<(), OperatorError>>,
    },
    Stop {
        program: String,
        reply: Reply<Result<(), OperatorError>>,
    },
    Restart {
        program: String,
        reply: Reply<Result<(), OperatorError>>,
    },
    Status {
        reply: Reply<StatusSnapshot>,
    },
    Reload {
        reply: Option<Reply<Result<(), ConfigError>>>,
        externally_triggered: bool,
    },
    Shutdown {
        reply: Reply<()>,
    },
    SpawnCompleted {
        key: ReplicaKey,
        generation: u64,
        pid: u32,
    },
    SpawnFailed {
        key: ReplicaKey,
        generation: u64,
        message: String,
    },
    StartGraceElapsed {
        key: ReplicaKey,
        generation: u64,
    },
    BackoffElapsed {
        key: ReplicaKey,
        generation: u64,
    },
    ChildExited {
        key: ReplicaKey,
        generation: u64,
        exit_code: Option<i32>,
    },
    StopTimerElapsed {
        key: ReplicaKey,
        generation: u64,
    },
}

/// Cheaply cloneable front door to a running engine. Every clone shares the
/// same command queue; signal handlers, the config watcher, and the
/// operator shell each hold one.
#[derive(Clone)]
pub struct EngineHandle {
    tx: SyncSender<Command>,
}

impl EngineHandle {
    /// `start(name)`: drives every replica of `name` to `Starting` and
    /// blocks until each has either survived its `startsecs` window or
    /// given up. Unknown program is an error.
    pub fn start(&self, program: &str) -> Result<(), OperatorError> {
        self.call(|reply| Command::Start {
            program: program.to_string(),
            reply,
        })
    }

    /// `stop(name)`: drives every live replica of `name` through the stop
    /// sub-protocol and blocks until each has been reaped.
    pub fn stop(&self, program: &str) -> Result<(), OperatorError> {
        self.call(|reply| Command::Stop {
            program: program.to_string(),
            reply,
        })
    }

    /// `restart(name)`: stop then start, sequenced.
    pub fn restart(&self, program: &str) -> Result<(), OperatorError> {
        self.call(|reply| Command::Restart {
            program: program.to_string(),
            reply,
        })
    }

    /// Snapshot of every declared replica's state and pid.
    pub fn status(&self) -> StatusSnapshot {
        self.call_infallible(|reply| Command::Status { reply })
    }

    /// `reload()` as issued from the operator prompt: blocks until the new
    /// config (or rejection) is resolved.
    pub fn reload(&self) -> Result<(), ConfigError> {
        self.call(|reply| Command::Reload {
            reply: Some(reply),
            externally_triggered: false,
        })
    }

    /// Fire-and-forget reload request, for SIGHUP and the file watcher.
    /// Returns `false` once the engine has shut down and can no longer be
    /// reached, so callers know to stop trying.
    pub fn reload_async(&self) -> bool {
        self.tx
            .send(Command::Reload {
                reply: None,
                externally_triggered: true,
            })
            .is_ok()
    }

    /// Drives every live replica through stop, then tears the engine down.
    /// Blocks until shutdown is complete.
    pub fn shutdown(&self) {
        let _ = self.call_infallible(|reply| Command::Shutdown { reply });
    }

    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> T
    where
        T: From<CallFailed>,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(build(reply_tx)).is_err() {
            return T::from(CallFailed);
        }
        reply_rx.recv().unwrap_or(T::from(CallFailed))
    }

    fn call_infallible<T: Default>(&self, build: impl FnOnce(Reply<T>) -> Command) -> T {
        let (reply_tx, reply_rx) = mpsc::channel();
        if self.tx.send(build(reply_tx)).is_err() {
            return T::default();
        }
        reply_rx.recv().unwrap_or_default()
    }
}

/// Marker used to translate "the engine thread is gone" into each
/// operation's own error/empty type via `From`.
struct CallFailed;

impl From<CallFailed> for Result<(), OperatorError> {
    fn from(_: CallFailed) -> Self {
        Err(OperatorError::UnknownProgram(
            "supervisor engine is not running".to_string(),
        ))
    }
}

impl From<CallFailed> for Result<(), ConfigError> {
    fn from(_: CallFailed) -> Self {
        Ok(())
    }
}

impl From<CallFailed> for () {
    fn from(_: CallFailed) -> Self {}
}

struct Replica {
    state: ReplicaState,
    pid: Option<u32>,
    retry_count: u32,
    started_ok: bool,
    generation: u64,
    start_cancel: Option<mpsc::Sender<()>>,
    last_error: Option<String>,
}

impl Replica {
    fn idle() -> Replica {
        Replica {
            state: ReplicaState::Idle,
            pid: None,
            retry_count: 0,
            started_ok: false,
            generation: 0,
            start_cancel: None,
            last_error: None,
        }
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state,
            ReplicaState::Starting
                | ReplicaState::Running
                | ReplicaState::Backoff
                | ReplicaState::Stopping
        )
    }
}

struct PendingStart {
    remaining: HashSet<ReplicaKey>,
    reply: Reply<Result<(), OperatorError>>,
}

struct PendingStop {
    remaining: HashSet<ReplicaKey>,
    reply: Reply<Result<(), OperatorError>>,
    then_start: bool,
}

struct PendingReload {
    candidate: Config,
    reply: Option<Reply<Result<(), ConfigError>>>,
    externally_triggered: bool,
}

/// The engine's owned state. Lives entirely on the engine thread; nothing
/// here is shared across threads except through the command queue.
pub struct Engine {
    config: Config,
    config_path: PathBuf,
    replicas: BTreeMap<ReplicaKey, Replica>,
    tx: SyncSender<Command>,
    pending_starts: Vec<PendingStart>,
    pending_stops: Vec<PendingStop>,
    pending_reload: Option<PendingReload>,
    shutdown_reply: Option<Reply<()>>,
    events: mpsc::Sender<EngineEvent>,
}

impl Engine {
    /// Loads the initial configuration, then spawns the engine thread and
    /// the config-file watcher. Returns a handle for issuing commands, a
    /// receiver for UI events, and the thread's join handle.
    pub fn spawn(
        config_path: PathBuf,
    ) -> Result<(EngineHandle, Receiver<EngineEvent>, std::thread::JoinHandle<()>), ConfigError>
    {
        let config = Config::load(&config_path)?;
        let (tx, rx) = mpsc::sync_channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::channel();
        let handle = EngineHandle { tx: tx.clone() };

        let mut engine = Engine {
            config,
            config_path: config_path.clone(),
            replicas: BTreeMap::new(),
            tx: tx.clone(),
            pending_starts: Vec::new(),
            pending_stops: Vec::new(),
            pending_reload: None,
            shutdown_reply: None,
            events: events_tx,
        };

        let join = std::thread::Builder::new()
            .name("taskmaster-engine".to_string())
            .spawn(move || engine.run(rx))
            .expect("failed to spawn engine thread");

        crate::watcher::spawn(config_path, handle.clone());

        Ok((handle, events_rx, join))
    }

    fn run(&mut self, rx: Receiver<Command>) {
        let autostart: Vec<String> = self
            .config
            .programs
            .iter()
            .filter(|(_, spec)| spec.autostart)
            .map(|(name, _)| name.clone())
            .collect();
        for name in autostart {
            self.begin_start(&name, None);
        }

        loop {
            match rx.recv_timeout(TICK_INTERVAL) {
                Ok(command) => {
                    if self.handle(command) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    /// Returns `true` when the engine should stop its loop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start { program, reply } => self.handle_start(program, reply),
            Command::Stop { program, reply } => self.handle_stop(program, reply, false),
            Command::Restart { program, reply } => self.handle_restart(program, reply),
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Reload {
                reply,
                externally_triggered,
            } => self.handle_reload(reply, externally_triggered),
            Command::Shutdown { reply } => return self.handle_shutdown(reply),
            Command::SpawnCompleted {
                key,
                generation,
                pid,
            } => self.on_spawn_completed(key, generation, pid),
            Command::SpawnFailed {
                key,
                generation,
                message,
            } => self.on_spawn_failed(key, generation, message),
            Command::StartGraceElapsed { key, generation } => {
                self.on_start_grace_elapsed(key, generation)
            }
            Command::BackoffElapsed { key, generation } => {
                self.on_backoff_elapsed(key, generation)
            }
            Command::ChildExited {
                key,
                generation,
                exit_code,
            } => self.on_child_exited(key, generation, exit_code),
            Command::StopTimerElapsed { key, generation } => {
                self.on_stop_timer_elapsed(key, generation)
            }
        }
        false
    }

    // -- operator-facing operations -----------------------------------

    fn handle_start(&mut self, program: String, reply: Reply<Result<(), OperatorError>>) {
        if !self.config.programs.contains_key(&program) {
            let _ = reply.send(Err(OperatorError::UnknownProgram(program)));
            return;
        }
        self.begin_start(&program, Some(reply));
    }

    fn handle_stop(
        &mut self,
        program: String,
        reply: Reply<Result<(), OperatorError>>,
        then_start: bool,
    ) {
        // Unknown program is silently ignored.
        let live: HashSet<ReplicaKey> = self
            .replicas
            .iter()
            .filter(|(k, r)| k.program == program && r.is_live())
            .map(|(k, _)| k.clone())
            .collect();

        if live.is_empty() {
            if then_start {
                self.begin_start(&program, Some(reply));
            } else {
                let _ = reply.send(Ok(()));
            }
            return;
        }

        for key in &live {
            self.begin_stop(key);
        }
        self.pending_stops.push(PendingStop {
            remaining: live,
            reply,
            then_start,
        });
    }

    fn handle_restart(&mut self, program: String, reply: Reply<Result<(), OperatorError>>) {
        if !self.config.programs.contains_key(&program) {
            let _ = reply.send(Err(OperatorError::UnknownProgram(program)));
            return;
        }
        self.handle_stop(program, reply, true);
    }

    fn handle_reload(
        &mut self,
        reply: Option<Reply<Result<(), ConfigError>>>,
        externally_triggered: bool,
    ) {
        let candidate = match Config::load(&self.config_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "reload rejected, keeping previous config");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        if !self.pending_starts.is_empty() {
            info!("reload deferred until in-flight starts complete");
            self.pending_reload = Some(PendingReload {
                candidate,
                reply,
                externally_triggered,
            });
            return;
        }

        self.apply_reload(candidate);
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        let _ = self.events.send(EngineEvent::ReloadCompleted {
            externally_triggered,
        });
    }

    fn handle_shutdown(&mut self, reply: Reply<()>) -> bool {
        let live: HashSet<ReplicaKey> = self
            .replicas
            .iter()
            .filter(|(_, r)| r.is_live())
            .map(|(k, _)| k.clone())
            .collect();

        if live.is_empty() {
            let _ = reply.send(());
            let _ = self.events.send(EngineEvent::ShuttingDown);
            return true;
        }

        for key in &live {
            self.begin_stop(key);
        }
        self.pending_stops.push(PendingStop {
            remaining: live,
            reply: unused_reply(),
            then_start: false,
        });
        self.shutdown_reply = Some(reply);
        let _ = self.events.send(EngineEvent::ShuttingDown);
        false
    }

    // -- reconciliation --------------------------------------------------

    fn apply_reload(&mut self, new_config: Config) {
        let old_names: HashSet<String> = self.config.programs.keys().cloned().collect();
        let new_names: HashSet<String> = new_config.programs.keys().cloned().collect();
        let old_numprocs: BTreeMap<String, u32> = self
            .config
            .programs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.numprocs))
            .collect();

        for removed in old_names.difference(&new_names) {
            info!(program = %removed, "program removed from config, stopping");
            let (tx, rx) = mpsc::channel();
            self.handle_stop(removed.clone(), tx, false);
            // Removal always drops the record once stopped; drain the
            // immediate no-op case inline, the async case is finished by
            // on_child_exited's pending-stop bookkeeping.
            let _ = rx.try_recv();
            self.replicas.retain(|k, _| &k.program != removed);
        }

        self.config = new_config;

        for (name, spec) in self.config.programs.clone() {
            let is_new = !old_names.contains(&name);
            self.reconcile_numprocs(&name, spec.numprocs);
            if !spec.autostart {
                continue;
            }
            if is_new {
                self.begin_start(&name, None);
            } else {
                // Existing program: only the freshly added high indices may
                // start. Indices that already existed keep whatever state
                // an operator left them in.
                let previous = old_numprocs.get(&name).copied().unwrap_or(0);
                if spec.numprocs > previous {
                    self.begin_start_indices(&name, previous..spec.numprocs, None);
                }
            }
        }
    }

    /// Stops replicas whose index is no longer `< numprocs` (shrink); new
    /// indices below the new `numprocs` are left `Idle` (grow) and are
    /// started by the caller, for both brand-new and existing programs,
    /// only when `autostart` is set.
    fn reconcile_numprocs(&mut self, program: &str, numprocs: u32) {
        let stale: Vec<ReplicaKey> = self
            .replicas
            .keys()
            .filter(|k| k.program == program && k.index >= numprocs)
            .cloned()
            .collect();
        for key in stale {
            if self.replicas.get(&key).is_some_and(Replica::is_live) {
                self.begin_stop(&key);
            }
            self.replicas.remove(&key);
        }
    }

    // -- start sub-protocol -----------------------------------------------

    fn begin_start(&mut self, program: &str, reply: Option<Reply<Result<(), OperatorError>>>) {
        let Some(numprocs) = self.config.programs.get(program).map(|s| s.numprocs) else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(OperatorError::UnknownProgram(program.to_string())));
            }
            return;
        };
        self.begin_start_indices(program, 0..numprocs, reply);
    }

    /// Drives replicas `indices` of `program` to `Starting`, skipping any
    /// that are already live. Used both for a full `start(name)` (`0..numprocs`)
    /// and for the newly added high indices of a `numprocs` grow on reload.
    fn begin_start_indices(
        &mut self,
        program: &str,
        indices: std::ops::Range<u32>,
        reply: Option<Reply<Result<(), OperatorError>>>,
    ) {
        let Some(spec) = self.config.programs.get(program).cloned() else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(OperatorError::UnknownProgram(program.to_string())));
            }
            return;
        };

        let mut remaining = HashSet::new();
        for index in indices {
            let key = ReplicaKey {
                program: program.to_string(),
                index,
            };
            let already_live = self.replicas.get(&key).is_some_and(Replica::is_live);
            if already_live {
                if let Some(r) = self.replicas.get(&key) {
                    info!(replica = %key, pid = ?r.pid, "already running");
                }
                continue;
            }
            self.spawn_one(&key, &spec);
            if let Some(record) = self.replicas.get_mut(&key) {
                record.retry_count = 0;
            }
            remaining.insert(key);
        }

        if let Some(reply) = reply {
            if remaining.is_empty() {
                let _ = reply.send(Ok(()));
            } else {
                self.pending_starts.push(PendingStart { remaining, reply });
            }
        }
    }

    fn spawn_one(&mut self, key: &ReplicaKey, spec: &crate::config::ProgramSpec) {
        let record = self.replicas.entry(key.clone()).or_insert_with(Replica::idle);
        record.generation += 1;
        record.state = ReplicaState::Starting;
        record.pid = None;
        record.last_error = None;
        let generation = record.generation;

        let (cancel_tx, cancel_rx) = mpsc::channel();
        record.start_cancel = Some(cancel_tx);

        let tx = self.tx.clone();
        let key = key.clone();
        let spec = spec.clone();
        std::thread::spawn(move || {
            run_starter(tx, key, spec, generation, cancel_rx);
        });
    }

    fn on_spawn_completed(&mut self, key: ReplicaKey, generation: u64, pid: u32) {
        let Some(record) = self.replicas.get_mut(&key) else {
            return;
        };
        if record.generation != generation {
            return;
        }
        record.pid = Some(pid);

        // A stop requested while the spawn was still in flight left the
        // replica in `Stopping` with no known pid to signal; deliver the
        // signal now that the pid is known instead of leaving it to the
        // unconditional stoptime kill.
        if record.state == ReplicaState::Stopping {
            self.arm_stop(&key);
        } else {
            info!(replica = %key, pid, "launched, waiting for start-grace window");
        }
    }

    fn on_spawn_failed(&mut self, key: ReplicaKey, generation: u64, message: String) {
        error!(replica = %key, error = %message, "failed to launch");
        self.record_failed_attempt(&key, generation);
    }

    fn on_start_grace_elapsed(&mut self, key: ReplicaKey, generation: u64) {
        let Some(record) = self.replicas.get_mut(&key) else {
            return;
        };
        if record.generation != generation || record.state != ReplicaState::Starting {
            return;
        }
        record.state = ReplicaState::Running;
        record.started_ok = true;
        record.retry_count = 0;
        record.start_cancel = None;
        info!(replica = %key, pid = ?record.pid, "running");
        self.resolve_pending_starts(&key);
    }

    fn on_backoff_elapsed(&mut self, key: ReplicaKey, generation: u64) {
        let Some(record) = self.replicas.get(&key) else {
            return;
        };
        if record.generation != generation || record.state != ReplicaState::Backoff {
            return;
        }
        let Some(spec) = self.config.programs.get(&key.program).cloned() else {
            return;
        };
        if let Some(record) = self.replicas.get_mut(&key) {
            record.state = ReplicaState::Starting;
        }
        self.spawn_one(&key, &spec);
    }

    fn record_failed_attempt(&mut self, key: &ReplicaKey, generation: u64) {
        let Some(spec) = self.config.programs.get(&key.program).cloned() else {
            return;
        };
        let Some(record) = self.replicas.get_mut(key) else {
            return;
        };
        if record.generation != generation {
            return;
        }
        record.pid = None;
        record.start_cancel = None;

        if record.state == ReplicaState::Stopping {
            record.state = ReplicaState::Stopped;
            info!(replica = %key, "stopped");
            self.resolve_pending_stops(key);
            return;
        }

        if record.retry_count < spec.startretries {
            record.retry_count += 1;
            record.state = ReplicaState::Backoff;
            warn!(
                replica = %key,
                attempt = record.retry_count,
                max = spec.startretries,
                "start failed, retrying after backoff"
            );
            let tx = self.tx.clone();
            let key = key.clone();
            let generation = record.generation;
            std::thread::spawn(move || {
                std::thread::sleep(BACKOFF_DELAY);
                let _ = tx.send(Command::BackoffElapsed { key, generation });
            });
        } else {
            record.state = ReplicaState::Fatal;
            let fatal = FatalReplica {
                program: key.program.clone(),
                index: key.index,
                retries: spec.startretries,
            };
            error!("{fatal}");
            record.last_error = Some(fatal.to_string());
            self.resolve_pending_starts(key);
        }
    }

    fn resolve_pending_starts(&mut self, key: &ReplicaKey) {
        let mut finished = Vec::new();
        for (i, pending) in self.pending_starts.iter_mut().enumerate() {
            pending.remaining.remove(key);
            if pending.remaining.is_empty() {
                finished.push(i);
            }
        }
        for i in finished.into_iter().rev() {
            let pending = self.pending_starts.remove(i);
            let _ = pending.reply.send(Ok(()));
        }
        self.maybe_apply_deferred_reload();
    }

    fn maybe_apply_deferred_reload(&mut self) {
        if !self.pending_starts.is_empty() {
            return;
        }
        if let Some(pending) = self.pending_reload.take() {
            self.apply_reload(pending.candidate);
            if let Some(reply) = pending.reply {
                let _ = reply.send(Ok(()));
            }
            let _ = self.events.send(EngineEvent::ReloadCompleted {
                externally_triggered: pending.externally_triggered,
            });
        }
    }

    // -- stop sub-protocol ------------------------------------------------

    fn begin_stop(&mut self, key: &ReplicaKey) {
        let Some(record) = self.replicas.get_mut(key) else {
            return;
        };

        // Cancel an in-flight start's grace wait: it abandons its wait and
        // the child is driven through the stop sub-protocol below instead.
        if let Some(cancel) = record.start_cancel.take() {
            let _ = cancel.send(());
        }

        let was_stopping = record.state == ReplicaState::Stopping;
        record.state = ReplicaState::Stopping;

        if was_stopping {
            return;
        }

        if record.pid.is_some() {
            self.arm_stop(key);
        }
        // else: pid not yet known, spawn still in flight. `arm_stop` runs
        // once `on_spawn_completed` sees the replica already Stopping.
    }

    /// Sends the configured stop signal and arms the stoptime escalation
    /// timer. Only valid once `record.pid` is known; called from
    /// `begin_stop` directly or, for a stop that raced a still-in-flight
    /// spawn, from `on_spawn_completed` once the pid arrives.
    fn arm_stop(&mut self, key: &ReplicaKey) {
        let Some(spec) = self.config.programs.get(&key.program).cloned() else {
            return;
        };
        let Some(record) = self.replicas.get_mut(key) else {
            return;
        };
        let generation = record.generation;
        if let Some(pid) = record.pid {
            send_signal(pid, spec.stopsignal.to_nix());
            info!(replica = %key, signal = %spec.stopsignal, "stopping");
        }

        let tx = self.tx.clone();
        let key = key.clone();
        let stoptime = spec.stoptime;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(stoptime));
            let _ = tx.send(Command::StopTimerElapsed { key, generation });
        });
    }

    fn on_stop_timer_elapsed(&mut self, key: ReplicaKey, generation: u64) {
        let Some(spec) = self.config.programs.get(&key.program).cloned() else {
            return;
        };
        let Some(record) = self.replicas.get_mut(&key) else {
            return;
        };
        if record.generation != generation || record.state != ReplicaState::Stopping {
            return;
        }
        if let Some(pid) = record.pid {
            let timeout = StopTimeout {
                stoptime_secs: spec.stoptime,
            };
            warn!("{timeout}");
            send_signal(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }

    fn on_child_exited(&mut self, key: ReplicaKey, generation: u64, exit_code: Option<i32>) {
        let Some(record) = self.replicas.get_mut(&key) else {
            return;
        };
        if record.generation != generation {
            return;
        }

        match record.state {
            ReplicaState::Starting => {
                debug!(replica = %key, exit_code, "exited before start-grace window");
                self.record_failed_attempt(&key, generation);
            }
            ReplicaState::Stopping => {
                record.pid = None;
                record.state = ReplicaState::Stopped;
                info!(replica = %key, "stopped");
                self.resolve_pending_stops(&key);
            }
            ReplicaState::Running => {
                let spec = self.config.programs.get(&key.program).cloned();
                let Some(spec) = spec else { return };
                let code = exit_code.unwrap_or(-1);
                let restart = should_restart(spec.autorestart, code, &spec.exitcodes);
                if restart {
                    info!(replica = %key, exit_code = code, "unexpected exit, restarting");
                    let record = self.replicas.get_mut(&key).unwrap();
                    record.retry_count = 0;
                    record.state = ReplicaState::Starting;
                    drop(record);
                    self.spawn_one(&key, &spec);
                } else {
                    let record = self.replicas.get_mut(&key).unwrap();
                    record.pid = None;
                    record.state = ReplicaState::Exited;
                    info!(replica = %key, exit_code = code, "exited");
                }
            }
            _ => {}
        }
    }

    fn resolve_pending_stops(&mut self, key: &ReplicaKey) {
        let mut finished = Vec::new();
        for (i, pending) in self.pending_stops.iter_mut().enumerate() {
            pending.remaining.remove(key);
            if pending.remaining.is_empty() {
                finished.push(i);
            }
        }
        for i in finished.into_iter().rev() {
            let pending = self.pending_stops.remove(i);
            if pending.then_start {
                let program = key.program.clone();
                self.begin_start(&program, Some(pending.reply));
            } else {
                let _ = pending.reply.send(Ok(()));
            }
        }
        if self.pending_stops.is_empty() {
            if let Some(reply) = self.shutdown_reply.take() {
                let _ = reply.send(());
            }
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        let replicas = self
            .replicas
            .iter()
            .map(|(key, record)| ReplicaStatus {
                key: key.clone(),
                state: record.state,
                pid: record.pid,
                last_error: record.last_error.clone(),
            })
            .collect();
        StatusSnapshot { replicas }
    }

}

fn unused_reply<T>() -> Reply<T> {
    let (tx, _rx) = mpsc::channel();
    tx
}

fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;
    if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, error = %e, "failed to signal process");
        }
    }
}

/// Runs entirely off the engine thread: blocks on the spawn syscall and the
/// `startsecs` wait, reporting back via the command queue so the engine
/// thread is never the one blocking.
fn run_starter(
    tx: SyncSender<Command>,
    key: ReplicaKey,
    spec: crate::config::ProgramSpec,
    generation: u64,
    cancel_rx: Receiver<()>,
) {
    match launcher::spawn(&spec) {
        Ok(ChildHandle { child, pid }) => {
            let _ = tx.send(Command::SpawnCompleted {
                key: key.clone(),
                generation,
                pid,
            });

            let watcher_tx = tx.clone();
            let watcher_key = key.clone();
            std::thread::spawn(move || run_watcher(watcher_tx, watcher_key, generation, child));

            match cancel_rx.recv_timeout(Duration::from_secs(spec.startsecs)) {
                Ok(()) => { /* start cancelled by a subsequent stop; say nothing */ }
                Err(_) => {
                    let _ = tx.send(Command::StartGraceElapsed { key, generation });
                }
            }
        }
        Err(e) => {
            let _ = tx.send(Command::SpawnFailed {
                key,
                generation,
                message: e.to_string(),
            });
        }
    }
}

/// Blocks on reaping exactly one child and reports its exit code.
fn run_watcher(
    tx: SyncSender<Command>,
    key: ReplicaKey,
    generation: u64,
    mut child: std::process::Child,
) {
    let exit_code = match child.wait() {
        Ok(status) => status.code(),
        Err(_) => None,
    };
    let _ = tx.send(Command::ChildExited {
        key,
        generation,
        exit_code,
    });
}
