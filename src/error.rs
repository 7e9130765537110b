//! Error and operation-context model (spec.md §4.5, §7).
//!
//! Grounded on `submerge-base::error` (a `Display`-free newtype wrapping a
//! backtrace-carrying inner error, logged through `tracing` at construction
//! time) generalised to spec.md's closed error-code enum plus an explicit
//! call-stack of frames, since nothing in the teacher crate returns a
//! structured error at all (every fallible entry point there returns a bare
//! `i32`/`*mut T`).

use std::fmt;

/// Closed set of error kinds used by the core (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Corruption,
    SrcSizeTooSmall,
    SrcSizeTooLarge,
    DstCapacityTooSmall,
    FormatVersionUnsupported,
    Allocation,
    FileOpen,
    FileRead,
    FileWrite,
    FileRemove,
    FileTruncate,
    NotFound,
    InvalidHeader,
    InvalidParam,
    ChunkAppend,
    ChunkInsert,
    ChunkUpdate,
    SchunkCopy,
    SchunkSpecial,
    FrameType,
    FrameSpecial,
    PluginIo,
    ContentChecksumWrong,
    Generic,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One entry of the optional call-stack an `Error` accumulates as it
/// propagates through intermediate layers (spec.md §4.5, §7 "forwarded
/// unchanged ... with an optional stack frame appended").
#[derive(Debug, Clone)]
pub struct Frame {
    pub file: &'static str,
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    message: String,
    stack: Vec<Frame>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[track_caller]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let message = message.into();
        let loc = std::panic::Location::caller();
        tracing::debug!(target: "blusc", code = ?code, file = loc.file(), line = loc.line(), "{message}");
        Error {
            code,
            message,
            stack: Vec::new(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn stack(&self) -> &[Frame] {
        &self.stack
    }

    /// Append a frame as the error is forwarded by an intermediate layer.
    #[track_caller]
    pub fn context(mut self, message: impl Into<String>) -> Self {
        let loc = std::panic::Location::caller();
        self.stack.push(Frame {
            file: loc.file(),
            line: loc.line(),
            message: message.into(),
        });
        self
    }

    /// Demote this error to a `Warning` (spec.md §4.5 `mark_as_warning`).
    pub fn into_warning(self) -> Warning {
        Warning(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for frame in &self.stack {
            write!(f, "\n  at {}:{}: {}", frame.file, frame.line, frame.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// An error that was explicitly demoted: no longer returned from the
/// failing call, but retrievable from the `OperationContext` that scoped it
/// (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct Warning(Error);

impl Warning {
    pub fn inner(&self) -> &Error {
        &self.0
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "warning: {}", self.0)
    }
}

/// Dynamic, per-operation error info: anything a leaf call wants to attach
/// beyond the closed `ErrorCode` (e.g. a plugin errno, an offending index).
/// Owned by the `OperationContext`, referenced — never copied — by the
/// errors it produced (spec.md §4.5).
#[derive(Debug, Default, Clone)]
pub struct DynamicErrorInfo {
    entries: Vec<(String, String)>,
}

impl DynamicErrorInfo {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Scopes one compression/decompression/graph-build call (spec.md §4.5).
/// `start` clears prior errors and warnings so state never leaks between
/// unrelated operations sharing a context.
#[derive(Debug, Default)]
pub struct OperationContext {
    warnings: Vec<Warning>,
    dynamic_info: DynamicErrorInfo,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.warnings.clear();
        self.dynamic_info = DynamicErrorInfo::default();
    }

    pub fn warn(&mut self, error: Error) {
        self.warnings.push(error.into_warning());
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn dynamic_info(&self) -> &DynamicErrorInfo {
        &self.dynamic_info
    }

    pub fn dynamic_info_mut(&mut self) -> &mut DynamicErrorInfo {
        &mut self.dynamic_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_stack_frames() {
        let err = Error::new(ErrorCode::Corruption, "bad block table").context("in decompress");
        let rendered = err.to_string();
        assert!(rendered.contains("Corruption"));
        assert!(rendered.contains("in decompress"));
    }

    #[test]
    fn warnings_collect_on_operation_context() {
        let mut ctx = OperationContext::new();
        ctx.start();
        ctx.warn(Error::new(ErrorCode::NotFound, "metalayer missing"));
        assert_eq!(ctx.warnings().len(), 1);
        ctx.start();
        assert!(ctx.warnings().is_empty());
    }

    #[test]
    fn dynamic_info_round_trips() {
        let mut info = DynamicErrorInfo::default();
        info.set("errno", "2");
        assert_eq!(info.get("errno"), Some("2"));
        assert_eq!(info.get("missing"), None);
    }
}
