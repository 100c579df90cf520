// SPDX-License-Identifier: Apache-2.0

//! Replica identity and the pure parts of the replica state machine (C4).
//!
//! The states and transition table live here as data; the engine (C5) is
//! what actually drives transitions, since doing so requires owning OS
//! process handles and threads that this module deliberately knows nothing
//! about.

use std::fmt;

use crate::config::AutoRestart;

/// Lifecycle state of one replica. See the transition table in the
/// supervisor engine for the events that move a replica between these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Idle,
    Starting,
    Running,
    Backoff,
    Stopping,
    Stopped,
    Exited,
    Fatal,
}

impl fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaState::Idle => "IDLE",
            ReplicaState::Starting => "STARTING",
            ReplicaState::Running => "RUNNING",
            ReplicaState::Backoff => "BACKOFF",
            ReplicaState::Stopping => "STOPPING",
            ReplicaState::Stopped => "STOPPED",
            ReplicaState::Exited => "EXITED",
            ReplicaState::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

/// Stable composite key `(program_name, index)`, `0 <= index < numprocs`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaKey {
    pub program: String,
    pub index: u32,
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.program, self.index)
    }
}

/// Given a termination's exit code and a program's restart policy, decides
/// whether the replica should be respawned. `always` still treats the retry
/// budget as scoped to the pre-`startsecs` window only: once a replica
/// reaches `Running` its retry counter resets, so a later crash always
/// respawns rather than ever going `Fatal`.
pub fn should_restart(policy: AutoRestart, exit_code: i32, exitcodes: &std::collections::BTreeSet<i32>) -> bool {
    match policy {
        AutoRestart::Never => false,
        AutoRestart::Always => true,
        AutoRestart::Unexpected => !exitcodes.contains(&exit_code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn never_does_not_restart() {
        assert!(!should_restart(AutoRestart::Never, 1, &BTreeSet::from([0])));
    }

    #[test]
    fn always_restarts_regardless_of_code() {
        assert!(should_restart(AutoRestart::Always, 0, &BTreeSet::from([0])));
        assert!(should_restart(AutoRestart::Always, 17, &BTreeSet::from([0])));
    }

    #[test]
    fn unexpected_restarts_only_outside_exitcodes() {
        let codes = BTreeSet::from([0, 2]);
        assert!(!should_restart(AutoRestart::Unexpected, 0, &codes));
        assert!(!should_restart(AutoRestart::Unexpected, 2, &codes));
        assert!(should_restart(AutoRestart::Unexpected, 1, &codes));
    }

    #[test]
    fn replica_key_displays_as_name_colon_index() {
        let key = ReplicaKey {
            program: "web".to_string(),
            index: 3,
        };
        assert_eq!(key.to_string(), "web:3");
    }
}
