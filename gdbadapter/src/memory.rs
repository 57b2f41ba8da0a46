/// Inferior memory access
///
/// Reads and writes go through `-data-read-memory-bytes` and
/// `-data-write-memory-bytes`, with contents encoded as hex.
///
/// A [`Memory`] handle is lenient by default: when GDB does not answer or
/// answers with an error, reads yield no bytes and writes are skipped, with a
/// warning logged. [`Memory::strict`] turns those failures into errors.
/// Invalid arguments are errors in both modes.

use std::ops::Range;
use thiserror::Error;

use crate::controller::{ControllerError, GdbController};
use crate::types::{ResultRecord, Value};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error(transparent)]
    Controller(#[from] ControllerError),
    #[error("Invalid range: end {end:#x} is before start {start:#x}")]
    InvalidRange { start: u64, end: u64 },
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },
    #[error("No answer to '{0}'")]
    NoAnswer(String),
    #[error("Memory access failed: {0}")]
    Command(String),
    #[error("Malformed memory reply: {0}")]
    MalformedReply(String),
    #[error("Invalid hex contents: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, MemoryError>;

/// How command-level failures are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorMode {
    /// Failed reads return no bytes, failed writes are ignored
    Lenient,
    /// Failures are returned as errors
    Strict,
}

#[derive(Clone, Copy)]
pub struct Memory<'a> {
    controller: &'a GdbController,
    mode: ErrorMode,
}

impl<'a> Memory<'a> {
    pub fn new(controller: &'a GdbController) -> Self {
        Self {
            controller,
            mode: ErrorMode::Lenient,
        }
    }

    pub fn strict(self) -> Self {
        Self {
            mode: ErrorMode::Strict,
            ..self
        }
    }

    pub fn mode(&self) -> ErrorMode {
        self.mode
    }

    /// Read `size` bytes at `address`
    pub async fn read(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let command = format!("-data-read-memory-bytes {address:#x} {size}");
        let outcome = match self.checked(&command).await {
            Ok(result) => memory_contents(&result),
            Err(e) => Err(e),
        };
        self.lenient(outcome, Vec::new)
    }

    pub async fn read_byte(&self, address: u64) -> Result<Option<u8>> {
        Ok(self.read(address, 1).await?.first().copied())
    }

    /// Read the half-open address range `start..end`
    pub async fn read_range(&self, range: Range<u64>) -> Result<Vec<u8>> {
        let size = range_size(&range)?;
        self.read(range.start, size).await
    }

    /// Write `data` at `address`
    pub async fn write(&self, address: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let command = format!("-data-write-memory-bytes {address:#x} {}", hex::encode(data));
        let outcome = self.checked(&command).await.map(|_| ());
        self.lenient(outcome, || ())
    }

    pub async fn write_byte(&self, address: u64, value: u8) -> Result<()> {
        self.write(address, &[value]).await
    }

    /// Write `data` over `start..end`; its length must match the range
    pub async fn write_range(&self, range: Range<u64>, data: &[u8]) -> Result<()> {
        let size = range_size(&range)?;
        if data.len() != size {
            return Err(MemoryError::SizeMismatch {
                expected: size,
                actual: data.len(),
            });
        }
        self.write(range.start, data).await
    }

    async fn checked(&self, command: &str) -> Result<ResultRecord> {
        let result = self
            .controller
            .exec_default(command)
            .await?
            .ok_or_else(|| MemoryError::NoAnswer(command.to_string()))?;

        if result.is_error() {
            let msg = result.error_message().unwrap_or("unknown error").to_string();
            return Err(MemoryError::Command(msg));
        }
        Ok(result)
    }

    fn lenient<T>(&self, outcome: Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
        match (outcome, self.mode) {
            (Ok(value), _) => Ok(value),
            (Err(e), ErrorMode::Lenient) => {
                log::warn!("Ignoring memory access failure: {}", e);
                Ok(fallback())
            }
            (Err(e), ErrorMode::Strict) => Err(e),
        }
    }
}

fn range_size(range: &Range<u64>) -> Result<usize> {
    if range.end < range.start {
        return Err(MemoryError::InvalidRange {
            start: range.start,
            end: range.end,
        });
    }
    usize::try_from(range.end - range.start).map_err(|_| MemoryError::InvalidRange {
        start: range.start,
        end: range.end,
    })
}

/// Concatenate the `contents` of every block in a `memory=[...]` reply
fn memory_contents(result: &ResultRecord) -> Result<Vec<u8>> {
    let blocks = result
        .payload
        .get("memory")
        .and_then(Value::as_list)
        .ok_or_else(|| MemoryError::MalformedReply("missing memory list".into()))?;

    let mut bytes = Vec::new();
    for block in blocks {
        let contents = block
            .get("contents")
            .and_then(Value::as_string)
            .ok_or_else(|| MemoryError::MalformedReply("block without contents".into()))?;
        bytes.extend(hex::decode(contents)?);
    }
    Ok(bytes)
}
