/// High-level debugging session
///
/// Turns intents (load, attach, run) into MI commands on top of
/// [`GdbController`] and translates error results into [`DebuggerError`]s.

use nix::pty::openpty;
use nix::unistd::ttyname;
use std::fmt;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::config::Config;
use crate::controller::{ControllerError, GdbController};
use crate::inferior::InferiorIo;
use crate::memory::Memory;
use crate::types::{Payload, ResultRecord, StopReason, Value};

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("Failed to allocate a pseudo-terminal: {0}")]
    Pty(#[from] nix::Error),
    #[error("No answer from GDB to '{0}'")]
    NoAnswer(String),
    #[error("{context}: {msg}")]
    Command { context: String, msg: String },
    #[error("Invalid target '{0}': expected a process id or an executable path")]
    InvalidTarget(String),
}

pub type Result<T> = std::result::Result<T, DebuggerError>;

/// What a session debugs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Attach to a running process
    Pid(u32),
    /// Load an executable with its symbols
    Path(PathBuf),
}

impl FromStr for Target {
    type Err = DebuggerError;

    /// All digits is a pid, anything else non-empty is a path
    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(DebuggerError::InvalidTarget(s.to_string()));
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse()
                .map(Target::Pid)
                .map_err(|_| DebuggerError::InvalidTarget(s.to_string()));
        }
        Ok(Target::Path(PathBuf::from(s)))
    }
}

impl From<u32> for Target {
    fn from(pid: u32) -> Self {
        Target::Pid(pid)
    }
}

impl From<PathBuf> for Target {
    fn from(path: PathBuf) -> Self {
        Target::Path(path)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pid(pid) => write!(f, "pid {pid}"),
            Target::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Start GDB and attach to or load `target`
pub async fn process(target: impl Into<Target>, config: &Config) -> Result<Debugger> {
    let debugger = Debugger::new(config)?;
    match target.into() {
        Target::Pid(pid) => debugger.attach(pid).await?,
        Target::Path(path) => debugger.load_executable(&path).await?,
    }
    Ok(debugger)
}

pub struct Debugger {
    controller: GdbController,
}

impl Debugger {
    /// Start a GDB session; must be called inside a tokio runtime
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self::with_controller(GdbController::spawn(config)?))
    }

    pub fn with_controller(controller: GdbController) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &GdbController {
        &self.controller
    }

    /// Lenient memory accessor; call [`Memory::strict`] for error reporting
    pub fn memory(&self) -> Memory<'_> {
        Memory::new(&self.controller)
    }

    pub async fn attach(&self, pid: u32) -> Result<()> {
        self.checked(&format!("-target-attach {pid}"), || {
            format!("Failed to attach to PID {pid}")
        })
        .await?;
        Ok(())
    }

    pub async fn load_executable(&self, path: &Path) -> Result<()> {
        let command = format!("-file-exec-and-symbols {}", quote(&path.to_string_lossy()));
        self.checked(&command, || {
            format!("Failed to load executable {}", path.display())
        })
        .await?;
        Ok(())
    }

    /// Start the loaded program with its stdio on a fresh pseudo-terminal
    pub async fn run(&self, args: &[String]) -> Result<InferiorIo> {
        let pty = openpty(None, None)?;
        let tty = ttyname(pty.slave.as_fd())?;
        log::debug!("Inferior terminal: {}", tty.display());

        self.checked(
            &format!("-inferior-tty-set {}", tty.display()),
            || "Failed to set inferior terminal".to_string(),
        )
        .await?;
        if !args.is_empty() {
            self.checked(&format!("-exec-arguments {}", args.join(" ")), || {
                "Failed to set program arguments".to_string()
            })
            .await?;
        }
        self.checked("-exec-run", || "Failed to run program".to_string())
            .await?;

        // the inferior holds its own copy of the slave side now
        drop(pty.slave);
        Ok(InferiorIo::from_fd(pty.master))
    }

    /// Stop the running inferior; completion is reported as a `stopped` event
    pub async fn interrupt(&self) -> Result<()> {
        self.checked("-exec-interrupt", || "Failed to interrupt".to_string())
            .await?;
        Ok(())
    }

    pub async fn cont(&self) -> Result<()> {
        self.checked("-exec-continue", || "Failed to continue".to_string())
            .await?;
        Ok(())
    }

    /// Call `callback` for every `stopped` event, replacing any previous one
    pub fn on_stop<F>(&self, callback: F)
    where
        F: Fn(Option<StopReason>, &Payload) + Send + Sync + 'static,
    {
        self.controller.register_callback("stopped", move |payload| {
            let reason = payload
                .get("reason")
                .and_then(Value::as_string)
                .and_then(StopReason::from_str);
            callback(reason, payload);
        });
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.controller.shutdown().await?;
        Ok(())
    }

    async fn checked(
        &self,
        command: &str,
        context: impl FnOnce() -> String,
    ) -> Result<ResultRecord> {
        let result = self
            .controller
            .exec_default(command)
            .await?
            .ok_or_else(|| DebuggerError::NoAnswer(command.to_string()))?;

        if result.is_error() {
            let msg = result.error_message().unwrap_or("unknown error").to_string();
            return Err(DebuggerError::Command {
                context: context(),
                msg,
            });
        }
        Ok(result)
    }
}

/// Quote a string as an MI c-string argument
fn quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('"');
    for ch in s.chars() {
        if ch == '"' || ch == '\\' {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}
