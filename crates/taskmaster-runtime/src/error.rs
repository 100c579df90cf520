// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the supervisor runtime.
//!
//! Every variant here corresponds to one of the five failure categories the
//! engine distinguishes: a bad declaration, a failed spawn, a bad operator
//! command, a stop that had to escalate, and a replica that gave up for good.
//! Only [`ConfigError`] on the *initial* load is ever fatal to the process;
//! everything else is recovered locally by the engine.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Malformed or invalid program declaration. The previous config is retained.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path} as YAML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("program `{program}`: {message}")]
    Invalid { program: String, message: String },
}

/// Failure to create a child. Treated by the engine as an immediate abnormal
/// exit for retry accounting purposes.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program `{program}`: failed to open log file {path}: {source}")]
    Io {
        program: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("program `{program}`: failed to exec `{command}`: {source}")]
    Exec {
        program: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Unknown verb, unknown program, or missing argument at the operator prompt.
/// Reported on the prompt; engine state is unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OperatorError {
    #[error("unknown command `{0}`")]
    UnknownVerb(String),

    #[error("unknown program `{0}`")]
    UnknownProgram(String),

    #[error("usage: {0}")]
    MissingArgument(String),
}

/// A child did not exit within its configured `stoptime` and was force-killed.
/// Not a failure — stop always completes — but worth reporting distinctly.
#[derive(Debug, Clone, Copy)]
pub struct StopTimeout {
    pub stoptime_secs: u64,
}

impl fmt::Display for StopTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "child did not exit within {}s, force-killed",
            self.stoptime_secs
        )
    }
}

/// A replica exhausted its retry budget before completing its first
/// successful start. Surfaced in `status`; the replica is parked in `Fatal`.
#[derive(Debug, Clone)]
pub struct FatalReplica {
    pub program: String,
    pub index: u32,
    pub retries: u32,
}

impl fmt::Display for FatalReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} reached max retries ({})",
            self.program, self.index, self.retries
        )
    }
}
