/// GDB Adapter for scripted debugging sessions
///
/// This crate drives GDB through its machine interface (GDB/MI):
///
/// - [`parser`] turns protocol lines into the record model in [`types`]
/// - [`controller`] owns the GDB process, reads its output in background
///   tasks, executes commands and dispatches async events ([`events`])
/// - [`inferior`] is the buffered, timeout-aware channel to the debugged
///   program's own stdio
/// - [`debugger`] and [`memory`] build load/attach/run and memory access on
///   top of the controller
///
/// Unix only: the inferior's stdio runs over a pseudo-terminal.

pub mod config;
pub mod controller;
pub mod debugger;
pub mod events;
pub mod inferior;
pub mod memory;
pub mod parser;
pub mod process;
pub mod types;

pub use config::Config;
pub use controller::{ControllerError, GdbController};
pub use debugger::{process, Debugger, DebuggerError, Target};
pub use inferior::{InferiorIo, StreamError};
pub use memory::{ErrorMode, Memory, MemoryError};
pub use parser::{parse_record, ParseError};
pub use types::*;
