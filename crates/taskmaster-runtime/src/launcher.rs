// SPDX-License-Identifier: Apache-2.0

//! Child launcher (C3): turns one [`ProgramSpec`] into one running child with
//! the prescribed environment.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::config::ProgramSpec;
use crate::error::LaunchError;

/// A spawned child, holding just enough to monitor and signal it later.
pub struct ChildHandle {
    pub child: Child,
    pub pid: u32,
}

/// Spawns one child for `spec`. Tokenizes `cmd` with shell-style quoting,
/// merges the supervisor's own environment with `spec.env`, applies and
/// restores `umask` around the spawn, and redirects stdio to the configured
/// paths (append mode, parent directories created as needed).
pub fn spawn(spec: &ProgramSpec) -> Result<ChildHandle, LaunchError> {
    let argv = shell_words::split(&spec.cmd).map_err(|source| LaunchError::Exec {
        program: spec.name.clone(),
        command: spec.cmd.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, source),
    })?;
    let (program, args) = argv
        .split_first()
        .map(|(p, rest)| (p.clone(), rest.to_vec()))
        .ok_or_else(|| LaunchError::Exec {
            program: spec.name.clone(),
            command: spec.cmd.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line"),
        })?;

    let stdout = open_redirect(spec, spec.stdout.as_deref())?;
    let stderr = open_redirect(spec, spec.stderr.as_deref())?;

    let env = effective_env(&spec.env);

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    if let Some(dir) = &spec.workingdir {
        cmd.current_dir(dir);
    }

    let _umask_guard = spec.umask.map(ScopedUmask::apply);

    let child = cmd.spawn().map_err(|source| LaunchError::Exec {
        program: spec.name.clone(),
        command: spec.cmd.clone(),
        source,
    })?;
    let pid = child.id();

    Ok(ChildHandle { child, pid })
}

/// Computes the effective child environment: the supervisor's own
/// environment with `overlay` merged on top.
fn effective_env(overlay: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = std::env::vars().collect();
    for (k, v) in overlay {
        env.insert(k.clone(), v.clone());
    }
    env
}

/// Opens a stdio redirect target in append mode, creating its parent
/// directory if needed. `None` redirects to the null device.
fn open_redirect(spec: &ProgramSpec, path: Option<&Path>) -> Result<Stdio, LaunchError> {
    let Some(path) = path else {
        return Ok(Stdio::null());
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| LaunchError::Io {
                program: spec.name.clone(),
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LaunchError::Io {
            program: spec.name.clone(),
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Stdio::from(file))
}

/// Applies a umask for the lifetime of this guard and restores the previous
/// value on drop. The restore happens on the calling thread, which is the
/// same thread `Command::spawn` forks from, so the child observes the
/// narrowed umask without it leaking back to the supervisor.
struct ScopedUmask {
    previous: nix::sys::stat::Mode,
}

impl ScopedUmask {
    #[cfg(unix)]
    fn apply(umask: u32) -> ScopedUmask {
        use nix::sys::stat::Mode;
        let mode = Mode::from_bits_truncate(umask);
        let previous = nix::sys::stat::umask(mode);
        ScopedUmask { previous }
    }

    #[cfg(not(unix))]
    fn apply(_umask: u32) -> ScopedUmask {
        ScopedUmask {
            previous: nix::sys::stat::Mode::empty(),
        }
    }
}

impl Drop for ScopedUmask {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            nix::sys::stat::umask(self.previous);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoRestart, StopSignal};
    use std::collections::BTreeSet;

    fn base_spec(cmd: &str) -> ProgramSpec {
        ProgramSpec {
            name: "test".to_string(),
            cmd: cmd.to_string(),
            numprocs: 1,
            autostart: false,
            autorestart: AutoRestart::Never,
            exitcodes: BTreeSet::from([0]),
            startsecs: 0,
            startretries: 0,
            stopsignal: StopSignal::Term,
            stoptime: 5,
            stdout: None,
            stderr: None,
            workingdir: None,
            env: BTreeMap::new(),
            umask: None,
        }
    }

    #[test]
    fn spawns_and_waits_on_true() {
        let mut handle = spawn(&base_spec("/bin/true")).expect("spawn should succeed");
        let status = handle.child.wait().expect("wait should succeed");
        assert!(status.success());
    }

    #[test]
    fn tokenizes_quoted_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let out_path = tmp.path().join("out.log");
        let mut spec = base_spec("/bin/sh -c 'echo \"hello world\"'");
        spec.stdout = Some(out_path.clone());
        let mut handle = spawn(&spec).expect("spawn should succeed");
        handle.child.wait().unwrap();
        let content = fs::read_to_string(out_path).unwrap();
        assert_eq!(content.trim(), "hello world");
    }

    #[test]
    fn creates_missing_log_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let out_path = tmp.path().join("nested").join("dir").join("out.log");
        let mut spec = base_spec("/bin/true");
        spec.stdout = Some(out_path.clone());
        let mut handle = spawn(&spec).expect("spawn should succeed");
        handle.child.wait().unwrap();
        assert!(out_path.exists());
    }

    #[test]
    fn env_overlay_wins_over_inherited() {
        let tmp = tempfile::tempdir().unwrap();
        let out_path = tmp.path().join("out.log");
        let mut spec = base_spec("/bin/sh -c 'echo $TASKMASTER_TEST_VAR'");
        spec.stdout = Some(out_path.clone());
        spec.env
            .insert("TASKMASTER_TEST_VAR".to_string(), "overlaid".to_string());
        let mut handle = spawn(&spec).expect("spawn should succeed");
        handle.child.wait().unwrap();
        let content = fs::read_to_string(out_path).unwrap();
        assert_eq!(content.trim(), "overlaid");
    }

    #[test]
    fn missing_command_is_a_launch_error() {
        let spec = base_spec("/no/such/binary-taskmaster-test");
        let err = spawn(&spec).unwrap_err();
        assert!(matches!(err, LaunchError::Exec { .. }));
    }
}
