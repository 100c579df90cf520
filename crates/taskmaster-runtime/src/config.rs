// SPDX-License-Identifier: Apache-2.0

//! Configuration model (C1) and loader (the `load` half of C2).
//!
//! Deserialization and validation are deliberately two passes. [`RawConfig`]
//! accepts whatever YAML shape is thrown at it — missing fields fall back to
//! defaults, unknown fields are dropped by serde automatically — and
//! [`RawProgram::validate`] is the only place that can fail. Nothing
//! downstream of this module re-checks a [`ProgramSpec`]; by the time the
//! engine sees one, it is already correct.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;

/// Restart policy evaluated against the exit code of a terminated child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoRestart {
    Never,
    Always,
    Unexpected,
}

impl FromStr for AutoRestart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(AutoRestart::Never),
            "always" => Ok(AutoRestart::Always),
            "unexpected" => Ok(AutoRestart::Unexpected),
            other => Err(format!(
                "invalid autorestart `{other}`, expected one of: never, always, unexpected"
            )),
        }
    }
}

/// Closed enumeration of stop signals. Validated at load time rather than
/// resolved reflectively when a stop is actually issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Term,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
}

impl StopSignal {
    /// Maps to the corresponding `nix` signal for delivery to a child.
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

impl FromStr for StopSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches("SIG").to_uppercase().as_str() {
            "TERM" => Ok(StopSignal::Term),
            "INT" => Ok(StopSignal::Int),
            "HUP" => Ok(StopSignal::Hup),
            "QUIT" => Ok(StopSignal::Quit),
            "USR1" => Ok(StopSignal::Usr1),
            "USR2" => Ok(StopSignal::Usr2),
            other => Err(format!(
                "invalid stopsignal `{other}`, expected one of: TERM, INT, HUP, QUIT, USR1, USR2"
            )),
        }
    }
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopSignal::Term => "TERM",
            StopSignal::Int => "INT",
            StopSignal::Hup => "HUP",
            StopSignal::Quit => "QUIT",
            StopSignal::Usr1 => "USR1",
            StopSignal::Usr2 => "USR2",
        };
        f.write_str(s)
    }
}

/// Validated, defaulted program declaration. Everything downstream trusts
/// this shape without re-checking it.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub name: String,
    pub cmd: String,
    pub numprocs: u32,
    pub autostart: bool,
    pub autorestart: AutoRestart,
    pub exitcodes: BTreeSet<i32>,
    pub startsecs: u64,
    pub startretries: u32,
    pub stopsignal: StopSignal,
    pub stoptime: u64,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub workingdir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub umask: Option<u32>,
}

/// Top-level configuration: every declared program, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub programs: BTreeMap<String, ProgramSpec>,
}

impl Config {
    /// Reads and validates a configuration file from disk.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parses and validates configuration text already read from `path`
    /// (kept separate from [`load`](Config::load) so tests can exercise it
    /// without touching the filesystem).
    pub fn parse(text: &str, path: &Path) -> Result<Config, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let mut programs = BTreeMap::new();
        for (name, raw_program) in raw.programs {
            let spec = raw_program.validate(&name)?;
            programs.insert(name, spec);
        }
        Ok(Config { programs })
    }
}

/// Permissive intermediate representation of the top-level YAML document.
/// Unknown keys are dropped by serde automatically, keeping the format
/// forward-compatible with fields this build doesn't know about.
#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    programs: BTreeMap<String, RawProgram>,
}

#[derive(Debug, Deserialize, Default)]
struct RawProgram {
    cmd: Option<String>,
    #[serde(default)]
    numprocs: Option<i64>,
    #[serde(default)]
    autostart: Option<bool>,
    #[serde(default)]
    autorestart: Option<String>,
    #[serde(default)]
    exitcodes: Option<Vec<i32>>,
    #[serde(default)]
    startsecs: Option<u64>,
    #[serde(default)]
    startretries: Option<u32>,
    #[serde(default)]
    stopsignal: Option<String>,
    #[serde(default)]
    stoptime: Option<u64>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    workingdir: Option<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    umask: Option<String>,
}

impl RawProgram {
    fn validate(self, name: &str) -> Result<ProgramSpec, ConfigError> {
        let invalid = |message: String| ConfigError::Invalid {
            program: name.to_string(),
            message,
        };

        let cmd = self
            .cmd
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| invalid("missing required field `cmd`".to_string()))?;

        let numprocs = match self.numprocs.unwrap_or(1) {
            n if n >= 1 => n as u32,
            n => return Err(invalid(format!("numprocs must be >= 1, got {n}"))),
        };

        let autorestart = match self.autorestart {
            Some(s) => AutoRestart::from_str(&s).map_err(invalid)?,
            None => AutoRestart::Never,
        };

        let exitcodes = self
            .exitcodes
            .map(|v| v.into_iter().collect())
            .unwrap_or_else(|| BTreeSet::from([0]));

        let stopsignal = match self.stopsignal {
            Some(s) => StopSignal::from_str(&s).map_err(invalid)?,
            None => StopSignal::Term,
        };

        let umask = match self.umask {
            Some(s) => Some(
                u32::from_str_radix(s.trim(), 8)
                    .map_err(|_| invalid(format!("umask `{s}` is not a valid octal string")))?,
            ),
            None => None,
        };

        Ok(ProgramSpec {
            name: name.to_string(),
            cmd,
            numprocs,
            autostart: self.autostart.unwrap_or(false),
            autorestart,
            exitcodes,
            startsecs: self.startsecs.unwrap_or(0),
            startretries: self.startretries.unwrap_or(0),
            stopsignal,
            stoptime: self.stoptime.unwrap_or(5),
            stdout: self.stdout.map(PathBuf::from),
            stderr: self.stderr.map(PathBuf::from),
            workingdir: self.workingdir.map(PathBuf::from),
            env: self.env.unwrap_or_default(),
            umask,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config, ConfigError> {
        Config::parse(yaml, Path::new("taskmaster.yaml"))
    }

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let cfg = parse("programs:\n  A:\n    cmd: /bin/true\n").unwrap();
        let a = &cfg.programs["A"];
        assert_eq!(a.numprocs, 1);
        assert!(!a.autostart);
        assert_eq!(a.autorestart, AutoRestart::Never);
        assert_eq!(a.exitcodes, BTreeSet::from([0]));
        assert_eq!(a.startsecs, 0);
        assert_eq!(a.startretries, 0);
        assert_eq!(a.stopsignal, StopSignal::Term);
        assert_eq!(a.stoptime, 5);
    }

    #[test]
    fn missing_cmd_fails() {
        let err = parse("programs:\n  A:\n    numprocs: 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn non_positive_numprocs_fails() {
        let err = parse("programs:\n  A:\n    cmd: x\n    numprocs: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unknown_stopsignal_fails() {
        let err = parse("programs:\n  A:\n    cmd: x\n    stopsignal: BOGUS\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn non_octal_umask_fails() {
        let err = parse("programs:\n  A:\n    cmd: x\n    umask: nope\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn bad_autorestart_literal_fails() {
        let err = parse("programs:\n  A:\n    cmd: x\n    autorestart: sometimes\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let cfg = parse("unused: true\nprograms:\n  A:\n    cmd: /bin/true\n    bogus: 1\n")
            .unwrap();
        assert!(cfg.programs.contains_key("A"));
    }

    #[test]
    fn umask_parses_as_octal() {
        let cfg = parse("programs:\n  A:\n    cmd: x\n    umask: \"022\"\n").unwrap();
        assert_eq!(cfg.programs["A"].umask, Some(0o022));
    }
}
