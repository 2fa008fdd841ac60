//! A single command execution against the device.
//!
//! Every command gets its own [`RemoteSession`] so that output capture of
//! concurrent commands never interleaves. Sessions are blocking and are driven
//! from the blocking thread pool by the adapter.

use crate::error::{Error, Result};
use std::io::Read;

/// Exit status reported for a command that never reached the device.
///
/// The value is arbitrary but part of the response contract.
pub const FAILED_TO_START_STATUS: i32 = 42;

/// Where the remote stderr ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrMode {
    #[default]
    Separate,
    /// Merged into stdout.
    Combined,
}

/// Raw output of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

/// Handles of a command started for streaming.
///
/// `stdout` and `stderr` may be read from different threads. `finish` waits
/// for the remote side to close and returns the exit status; call it only
/// after both streams are drained.
pub struct RunningCommand {
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Box<dyn Read + Send>,
    pub finish: Box<dyn FnOnce() -> Result<i32> + Send>,
}

pub trait RemoteSession: Send {
    /// Runs `command` to completion, feeding `stdin` if given.
    ///
    /// `Err` means the command could not be started or the channel broke
    /// before an exit status was received.
    fn run(
        self: Box<Self>,
        command: &str,
        stdin: Option<&[u8]>,
        stderr: StderrMode,
    ) -> Result<SessionOutput>;

    /// Starts `command` and hands back its output streams.
    fn start(self: Box<Self>, command: &str) -> Result<RunningCommand>;
}

/// Outcome of a remote command as reported to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
    /// False when the command never reached the device.
    pub started: bool,
    /// True when the command terminated abnormally (non-zero status).
    pub signaled: bool,
    pub error_message: String,
}

impl ExecResult {
    pub fn failed_to_start(error: &Error) -> Self {
        Self {
            exit_status: FAILED_TO_START_STATUS,
            started: false,
            signaled: false,
            error_message: error.to_string(),
            ..Self::default()
        }
    }

    pub fn from_output(output: SessionOutput) -> Self {
        Self {
            signaled: output.exit_status != 0,
            exit_status: output.exit_status,
            stdout: output.stdout,
            stderr: output.stderr,
            started: true,
            error_message: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.started && self.exit_status == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Turns anything but a clean exit into an error, returning stdout.
    pub fn into_stdout(self, command: &str) -> Result<String> {
        if !self.started {
            return Err(Error::Transport(format!(
                "failed to start `{}`: {}",
                command, self.error_message
            )));
        }
        if self.exit_status != 0 {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                status: self.exit_status,
                stderr: self.stderr_lossy().trim().to_string(),
            });
        }
        Ok(self.stdout_lossy())
    }
}

/// Joins a command and its arguments the way the device shell expects.
///
/// No quoting is applied; callers are responsible for shell safety.
pub fn join_command(command: &str, args: &[&str]) -> String {
    std::iter::once(command)
        .chain(args.iter().copied())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
