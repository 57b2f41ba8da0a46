/// Process management for GDB
///
/// This module handles GDB process creation and signalling.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to start GDB process: {0}")]
    StartError(#[from] std::io::Error),
    #[error("Failed to open GDB {0} pipe")]
    MissingPipe(&'static str),
    #[error("Process terminated unexpectedly")]
    Terminated,
    #[error("Signal error: {0}")]
    SignalError(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// The three pipes of a freshly started debugger
pub struct GdbPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

pub struct GdbProcess {
    child: Child,
}

impl GdbProcess {
    /// Start a new GDB process with MI interface
    pub fn start(config: &Config) -> Result<(Self, GdbPipes)> {
        log::debug!(
            "Starting GDB process: {} {:?}",
            config.gdb_path.display(),
            config.gdb_args
        );

        let mut child = Command::new(&config.gdb_path)
            .args(&config.gdb_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pipes = GdbPipes {
            stdin: child.stdin.take().ok_or(ProcessError::MissingPipe("stdin"))?,
            stdout: child.stdout.take().ok_or(ProcessError::MissingPipe("stdout"))?,
            stderr: child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?,
        };

        log::debug!("GDB process started with PID: {:?}", child.id());

        Ok((GdbProcess { child }, pipes))
    }

    /// Get the process ID, `None` once the process has been reaped
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Send SIGINT to the GDB process
    pub fn interrupt(&self) -> Result<()> {
        let pid = self.id().ok_or(ProcessError::Terminated)?;
        log::debug!("Sending SIGINT to GDB PID: {}", pid);

        let pid = i32::try_from(pid).map_err(|_| ProcessError::Terminated)?;
        signal::kill(Pid::from_raw(pid), Signal::SIGINT).map_err(|e| {
            log::error!("Failed to send SIGINT to PID {}: {}", pid, e);
            ProcessError::SignalError(e)
        })
    }

    /// Kill the GDB process and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}
