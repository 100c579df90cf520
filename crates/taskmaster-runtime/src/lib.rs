// SPDX-License-Identifier: Apache-2.0

//! Process supervision runtime: configuration model, child launcher,
//! replica state machine, config watcher, and the supervisor engine that
//! ties them together behind a serialized command queue.

pub mod config;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod replica;
pub mod watcher;

pub use config::{AutoRestart, Config, ProgramSpec, StopSignal};
pub use engine::{Engine, EngineEvent, EngineHandle, ReplicaStatus, StatusSnapshot};
pub use error::{ConfigError, FatalReplica, LaunchError, OperatorError, StopTimeout};
pub use replica::{should_restart, ReplicaKey, ReplicaState};

/// Crate version, surfaced for diagnostics and the CLI's `--version`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
