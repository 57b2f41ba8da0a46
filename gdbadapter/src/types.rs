/// GDB/MI record model
///
/// This module defines the data structures a parsed line of GDB/MI output
/// is turned into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key/value payload carried by result and async records
pub type Payload = BTreeMap<String, Value>;

/// One parsed line of GDB/MI output
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Result(ResultRecord),
    Async(AsyncRecord),
    Stream(StreamRecord),
    Prompt,
}

/// Represents a GDB/MI result record (`^done,...`)
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub token: Option<u64>,
    pub class: ResultClass,
    pub payload: Payload,
}

impl ResultRecord {
    pub fn is_error(&self) -> bool {
        self.class == ResultClass::Error
    }

    /// The `msg` field of an error result
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.payload.get("msg").and_then(Value::as_string)
    }
}

/// GDB/MI result classes
///
/// Unknown classes are kept verbatim rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
    Other(String),
}

impl ResultClass {
    pub fn as_str(&self) -> &str {
        match self {
            ResultClass::Done => "done",
            ResultClass::Running => "running",
            ResultClass::Connected => "connected",
            ResultClass::Error => "error",
            ResultClass::Exit => "exit",
            ResultClass::Other(other) => other,
        }
    }
}

impl From<&str> for ResultClass {
    fn from(s: &str) -> Self {
        match s {
            "done" => ResultClass::Done,
            "running" => ResultClass::Running,
            "connected" => ResultClass::Connected,
            "error" => ResultClass::Error,
            "exit" => ResultClass::Exit,
            other => ResultClass::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ResultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which out-of-band channel an async record arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    Exec,   // * prefix
    Status, // + prefix
    Notify, // = prefix
}

impl AsyncKind {
    pub fn from_sigil(c: char) -> Option<Self> {
        match c {
            '*' => Some(AsyncKind::Exec),
            '+' => Some(AsyncKind::Status),
            '=' => Some(AsyncKind::Notify),
            _ => None,
        }
    }
}

/// Represents a GDB/MI async record (`*stopped,...`)
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRecord {
    pub token: Option<u64>,
    pub kind: AsyncKind,
    pub class: String,
    pub payload: Payload,
}

impl AsyncRecord {
    /// Decoded stop reason of a `stopped` record
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.class != "stopped" {
            return None;
        }
        self.payload
            .get("reason")
            .and_then(Value::as_string)
            .and_then(StopReason::from_str)
    }
}

/// Represents a GDB/MI stream record
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream_type: StreamType,
    pub content: String,
}

impl StreamRecord {
    /// Content with C escape sequences decoded, for display
    pub fn text(&self) -> String {
        unescape_c_string(&self.content)
    }
}

/// Types of GDB/MI streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Console, // ~ prefix
    Target,  // @ prefix
    Log,     // & prefix
}

impl StreamType {
    pub fn from_sigil(c: char) -> Option<Self> {
        match c {
            '~' => Some(StreamType::Console),
            '@' => Some(StreamType::Target),
            '&' => Some(StreamType::Log),
            _ => None,
        }
    }
}

/// Represents values in GDB/MI output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    List(Vec<Value>),
    Tuple(Payload),
}

impl Value {
    /// Get the value as a string, if possible
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a list, if possible
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    /// Get the value as a tuple, if possible
    pub fn as_tuple(&self) -> Option<&Payload> {
        match self {
            Value::Tuple(tuple) => Some(tuple),
            _ => None,
        }
    }

    /// Look up a key when this value is a tuple
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_tuple().and_then(|tuple| tuple.get(key))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

/// Stop reason for stopped events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BreakpointHit,
    WatchpointTrigger,
    ReadWatchpointTrigger,
    AccessWatchpointTrigger,
    FunctionFinished,
    LocationReached,
    WatchpointScope,
    EndSteppingRange,
    ExitedSignalled,
    Exited,
    ExitedNormally,
    SignalReceived,
    SolibEvent,
    Fork,
    Vfork,
    SyscallEntry,
    SyscallReturn,
    Exec,
    NoHistory,
}

impl StopReason {
    const ALL: [(StopReason, &'static str); 19] = [
        (StopReason::BreakpointHit, "breakpoint-hit"),
        (StopReason::WatchpointTrigger, "watchpoint-trigger"),
        (StopReason::ReadWatchpointTrigger, "read-watchpoint-trigger"),
        (StopReason::AccessWatchpointTrigger, "access-watchpoint-trigger"),
        (StopReason::FunctionFinished, "function-finished"),
        (StopReason::LocationReached, "location-reached"),
        (StopReason::WatchpointScope, "watchpoint-scope"),
        (StopReason::EndSteppingRange, "end-stepping-range"),
        (StopReason::ExitedSignalled, "exited-signalled"),
        (StopReason::Exited, "exited"),
        (StopReason::ExitedNormally, "exited-normally"),
        (StopReason::SignalReceived, "signal-received"),
        (StopReason::SolibEvent, "solib-event"),
        (StopReason::Fork, "fork"),
        (StopReason::Vfork, "vfork"),
        (StopReason::SyscallEntry, "syscall-entry"),
        (StopReason::SyscallReturn, "syscall-return"),
        (StopReason::Exec, "exec"),
        (StopReason::NoHistory, "no-history"),
    ];

    /// Parse a stop reason from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(reason, _)| *reason)
    }

    pub fn as_str(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(reason, _)| *reason == self)
            .map_or("unknown", |(_, name)| *name)
    }

    /// Whether the inferior is gone after stopping for this reason
    pub fn is_exit(self) -> bool {
        matches!(
            self,
            StopReason::Exited | StopReason::ExitedNormally | StopReason::ExitedSignalled
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode C-style escape sequences (`\n`, `\t`, `\r`, `\\`, `\"`)
pub fn unescape_c_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            result.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('\\') => result.push('\\'),
            Some('"') => result.push('"'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    result
}
