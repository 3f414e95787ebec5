#![allow(unsafe_code)]
//! Child-process lifecycle: launch, runner detection, wait/reap.
//!
//! The launcher creates four anonymous pipes, forks, rewires the child's
//! stdout/stderr onto two of them, and re-executes the current binary with
//! three internal environment markers: a sentinel selecting runner mode and
//! the two control-pipe descriptors as decimal ASCII (descriptors must
//! survive the `exec` boundary, so they travel as text).
//!
//! Safety posture follows the fork/exec sequence rules: the child performs
//! the minimum before `exec`, and every child-side error path `_exit`s —
//! returning from the child would let a forked duplicate keep executing the
//! supervisor's code.

use std::env;
use std::ffi::{CString, OsString};
use std::fs;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::libc;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tracing::debug;

use crate::fault;
use crate::pipe::{self, InputEnd, OutputEnd};
use crate::wire;

const RUNNER_MODE_ENV: &str = "CORDON_INTERNAL_RUNNER_k2Rw84Jd";
const RUNNER_MODE_VALUE: &str = "Vq3uM1xPz7TgWl0aH9sKeYb5RcN2dFo6";
const COMMAND_SOURCE_ENV: &str = "CORDON_INTERNAL_COMMAND_SOURCE_t5Bq71Lm";
const RESPONSE_SINK_ENV: &str = "CORDON_INTERNAL_RESPONSE_SINK_j8Xz30Vn";

const DESCRIPTOR_BASE: u8 = 10;

// Child-side exit codes for pre-exec failures. Never seen on the happy
// path; they make a broken environment diagnosable from the wait status.
const EXIT_DUP_FAILED: i32 = 70;
const EXIT_NO_EXE_PATH: i32 = 71;
const EXIT_BAD_EXE_PATH: i32 = 72;
const EXIT_EXEC_FAILED: i32 = 73;

/// Launcher failure observed in the parent. Child-side failures `_exit`
/// instead and surface through the wait status.
#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error("failed to fork test runner: {0}")]
    Fork(#[source] Errno),

    #[error("failed to wait for test runner: {0}")]
    Wait(#[source] Errno),
}

/// How the runner child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl ChildStatus {
    pub(crate) fn is_clean_exit(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ChildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "signal {signal}"),
        }
    }
}

/// The supervisor's handle on the spawned runner: the child pid plus the
/// four pipe ends that stayed with the parent.
///
/// The pipe ends are plain fields so the supervisor can close the command
/// end mid-run (`command = None` signals shutdown to the runner) while the
/// poll guard keeps borrowing the three read ends.
pub(crate) struct ChildProcess {
    pid: Pid,
    pub(crate) command: Option<InputEnd>,
    pub(crate) response: OutputEnd,
    pub(crate) std_out: OutputEnd,
    pub(crate) std_err: OutputEnd,
}

impl ChildProcess {
    /// Creates the pipe topology, forks, and re-executes the current binary
    /// in runner mode. Returns the parent-side handle; in the child this
    /// never returns.
    pub(crate) fn spawn() -> Result<Self, LaunchError> {
        let (cmd_read, cmd_write) = pipe::create();
        let (resp_read, resp_write) = pipe::create();
        let (out_read, out_write) = pipe::create();
        let (err_read, err_write) = pipe::create();

        // SAFETY: the child branch only rewires descriptors, builds the
        // exec arguments, and execs; on any failure it `_exit`s without
        // returning into harness code. The supervisor is single-threaded
        // (see the concurrency model), so allocating in the child is sound.
        match unsafe { fork() }.map_err(LaunchError::Fork)? {
            ForkResult::Parent { child } => {
                drop(cmd_read);
                drop(resp_write);
                drop(out_write);
                drop(err_write);

                debug!(pid = %child, "spawned test runner");
                Ok(Self {
                    pid: child,
                    command: Some(cmd_write),
                    response: resp_read,
                    std_out: out_read,
                    std_err: err_read,
                })
            }
            ForkResult::Child => {
                drop(cmd_write);
                drop(resp_read);
                drop(out_read);
                drop(err_read);

                exec_runner(cmd_read, resp_write, out_write, err_write)
            }
        }
    }

    /// The command write end; a contract violation once it was closed for
    /// shutdown.
    pub(crate) fn command(&self) -> &InputEnd {
        self.command
            .as_ref()
            .unwrap_or_else(|| fault::contract_violation("command pipe already closed"))
    }

    /// Reaps the child, yielding its exit code or terminating signal.
    pub(crate) fn wait(&self) -> Result<ChildStatus, LaunchError> {
        let status = match waitpid(self.pid, None).map_err(LaunchError::Wait)? {
            WaitStatus::Exited(_, code) => ChildStatus::Exited(code),
            WaitStatus::Signaled(_, signal, _) => ChildStatus::Signaled(signal as i32),
            other => fault::contract_violation(&format!(
                "unexpected wait status for test runner: {other:?}"
            )),
        };
        debug!(pid = %self.pid, %status, "reaped test runner");
        Ok(status)
    }
}

/// Child side of [`ChildProcess::spawn`]: rewire stdio, set the markers,
/// and replace the process image. Diverges.
fn exec_runner(
    cmd_read: OutputEnd,
    resp_write: InputEnd,
    out_write: InputEnd,
    err_write: InputEnd,
) -> ! {
    // SAFETY: dup2 onto the standard descriptors, then drop the originals.
    // _exit is the only legal way out of a failed child.
    unsafe {
        if libc::dup2(out_write.as_raw(), libc::STDOUT_FILENO) < 0 {
            libc::_exit(EXIT_DUP_FAILED);
        }
        if libc::dup2(err_write.as_raw(), libc::STDERR_FILENO) < 0 {
            libc::_exit(EXIT_DUP_FAILED);
        }
    }
    drop(out_write);
    drop(err_write);

    let Some(exe) = current_exe_canonical() else {
        // SAFETY: child process, see above.
        unsafe { libc::_exit(EXIT_NO_EXE_PATH) };
    };
    let Ok(exe) = CString::new(exe.into_os_string().into_vec()) else {
        // SAFETY: child process, see above.
        unsafe { libc::_exit(EXIT_BAD_EXE_PATH) };
    };

    let argv = [exe.clone()];
    let envp = runner_environment(
        cmd_read.as_fd().as_raw_fd(),
        resp_write.as_raw(),
    );

    // The control-pipe ends must stay open across exec: keep their owners
    // alive until the image is replaced.
    let _ = nix::unistd::execve(&exe, &argv, &envp);

    // SAFETY: exec only comes back on failure; child process, see above.
    unsafe { libc::_exit(EXIT_EXEC_FAILED) };
}

/// The inherited environment plus the three runner markers, as `KEY=VALUE`
/// C strings. Entries that cannot be represented (interior NUL) are
/// skipped; the harness never creates such entries itself.
fn runner_environment(cmd_read_fd: i32, resp_write_fd: i32) -> Vec<CString> {
    let mut envp = Vec::new();

    let mut push = |key: &str, value: &str| {
        let mut entry = OsString::from(key);
        entry.push("=");
        entry.push(value);
        if let Ok(entry) = CString::new(entry.into_vec()) {
            envp.push(entry);
        }
    };

    push(RUNNER_MODE_ENV, RUNNER_MODE_VALUE);
    push(
        COMMAND_SOURCE_ENV,
        &wire::encode_int(cmd_read_fd as u64, DESCRIPTOR_BASE),
    );
    push(
        RESPONSE_SINK_ENV,
        &wire::encode_int(resp_write_fd as u64, DESCRIPTOR_BASE),
    );

    for (key, value) in env::vars_os() {
        let mut entry = key;
        entry.push("=");
        entry.push(&value);
        if let Ok(entry) = CString::new(entry.into_vec()) {
            envp.push(entry);
        }
    }

    envp
}

fn current_exe_canonical() -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    fs::canonicalize(exe).ok()
}

/// Runner-mode detection and control-pipe recovery.
///
/// Returns `Some((command_source, response_sink))` iff the runner marker
/// carries the sentinel value. All three markers are unset on the way out,
/// so the binary behaves like a fresh invocation if a test forks further.
pub(crate) fn runner_endpoints() -> Option<(OutputEnd, InputEnd)> {
    let mode = env::var_os(RUNNER_MODE_ENV)?;
    env::remove_var(RUNNER_MODE_ENV);
    if mode.as_os_str().as_bytes() != RUNNER_MODE_VALUE.as_bytes() {
        return None;
    }

    let command = consume_descriptor_marker(COMMAND_SOURCE_ENV);
    let response = consume_descriptor_marker(RESPONSE_SINK_ENV);

    // SAFETY: the descriptors were placed in the environment by the
    // launcher for exactly this process to adopt; nothing else owns them.
    let command = unsafe { OwnedFd::from_raw_fd(command) };
    let response = unsafe { OwnedFd::from_raw_fd(response) };

    Some((
        OutputEnd::from_owned(command),
        InputEnd::from_owned(response),
    ))
}

fn consume_descriptor_marker(name: &str) -> i32 {
    let value = env::var(name).unwrap_or_else(|_| {
        fault::contract_violation(&format!("runner descriptor marker missing or non-UTF-8: {name}"))
    });
    env::remove_var(name);

    let raw = wire::decode_int(&value, DESCRIPTOR_BASE).unwrap_or_else(|err| {
        fault::contract_violation(&format!("runner descriptor marker malformed: {err}"))
    });
    i32::try_from(raw)
        .unwrap_or_else(|_| fault::contract_violation("runner descriptor out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_status_formats_both_endings() {
        assert_eq!(ChildStatus::Exited(0).to_string(), "exit code 0");
        assert_eq!(ChildStatus::Signaled(6).to_string(), "signal 6");
        assert!(ChildStatus::Exited(0).is_clean_exit());
        assert!(!ChildStatus::Exited(1).is_clean_exit());
        assert!(!ChildStatus::Signaled(11).is_clean_exit());
    }

    #[test]
    fn runner_markers_absent_in_supervisor_mode() {
        // The library test binary is never spawned by a launcher.
        assert!(runner_endpoints().is_none());
    }

    #[test]
    fn environment_carries_the_three_markers_first() {
        let envp = runner_environment(5, 9);
        let as_str = |c: &CString| c.to_str().expect("marker is ASCII").to_owned();

        assert_eq!(
            as_str(&envp[0]),
            format!("{RUNNER_MODE_ENV}={RUNNER_MODE_VALUE}")
        );
        assert_eq!(as_str(&envp[1]), format!("{COMMAND_SOURCE_ENV}=5"));
        assert_eq!(as_str(&envp[2]), format!("{RESPONSE_SINK_ENV}=9"));
        // The inherited environment follows.
        assert!(envp.len() >= 3);
    }
}
