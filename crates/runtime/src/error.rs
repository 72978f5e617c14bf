//! Error types for the Teal session runtime.

use teal_vm::{FutureId, ThreadId, VmError};
use thiserror::Error;

/// Runtime errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Unknown session
    #[error("Couldn't find that session: {id}")]
    SessionNotFound { id: String },

    /// Unknown thread within a session
    #[error("Thread not found: session {session}, thread {thread}")]
    ThreadNotFound { session: String, thread: ThreadId },

    /// Unknown future within a session
    #[error("Future not found: session {session}, future {future}")]
    FutureNotFound { session: String, future: FutureId },

    /// Single-assignment violation or inconsistent chain
    #[error("Future violation: future {future}: {reason}")]
    FutureViolation { future: FutureId, reason: String },

    /// Could not acquire the session lock in time
    #[error("Lock timeout: session {session}, waited {waited_ms}ms")]
    LockTimeout { session: String, waited_ms: u64 },

    /// Transport to another worker failed
    #[error("Dispatch error: {reason}")]
    Dispatch { reason: String },

    /// The storage backend reported a failure
    #[error("Storage error: {reason}")]
    Storage { reason: String },

    /// Wall-clock timeout at the entry API
    #[error("Timeout after {seconds}s waiting for finish")]
    Timeout { seconds: u64 },

    /// Compile-time error from the code compiler capability
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// A VM error surfaced from a cycle
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl RuntimeError {
    /// Create a new session-not-found error
    pub fn session_not_found<S: Into<String>>(id: S) -> Self {
        Self::SessionNotFound { id: id.into() }
    }

    /// Create a new future violation error
    pub fn future_violation<S: Into<String>>(future: FutureId, reason: S) -> Self {
        Self::FutureViolation {
            future,
            reason: reason.into(),
        }
    }

    /// Create a new dispatch error
    pub fn dispatch<S: Into<String>>(reason: S) -> Self {
        Self::Dispatch {
            reason: reason.into(),
        }
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(reason: S) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::SessionNotFound { .. }
            | RuntimeError::ThreadNotFound { .. }
            | RuntimeError::FutureNotFound { .. } => "not-found",
            RuntimeError::FutureViolation { .. } => "future",
            RuntimeError::LockTimeout { .. } => "lock",
            RuntimeError::Dispatch { .. } => "dispatch",
            RuntimeError::Storage { .. } => "storage",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::Compile(_) => "compile",
            RuntimeError::Vm(_) => "vm",
        }
    }
}

/// Result type for runtime operations
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// A compile-time diagnostic from the code compiler capability.
///
/// Rendered with the source context and a caret pointing at the column:
///
/// ```text
/// error: unexpected token
///  --> service.tl:3:7
///   |
///   | (print (+ 1 ~))
///   |       ^
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Human-readable message
    pub message: String,

    /// Source file name, when known
    pub filename: Option<String>,

    /// 1-based line number
    pub line: u32,

    /// 1-based column number
    pub column: u32,

    /// The offending source line, when available
    pub source_line: Option<String>,
}

impl CompileError {
    /// Creates a diagnostic with position information.
    pub fn new<S: Into<String>>(message: S, line: u32, column: u32) -> Self {
        Self {
            message: message.into(),
            filename: None,
            line,
            column,
            source_line: None,
        }
    }

    /// Attaches a file name.
    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Attaches the offending source line.
    pub fn with_source_line<S: Into<String>>(mut self, source_line: S) -> Self {
        self.source_line = Some(source_line.into());
        self
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error: {}", self.message)?;
        let filename = self.filename.as_deref().unwrap_or("<input>");
        write!(f, "\n --> {filename}:{}:{}", self.line, self.column)?;
        if let Some(source_line) = &self.source_line {
            write!(f, "\n  |")?;
            write!(f, "\n  | {source_line}")?;
            let caret_pad = " ".repeat(self.column.saturating_sub(1) as usize);
            write!(f, "\n  | {caret_pad}^")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(RuntimeError::session_not_found("x").category(), "not-found");
        assert_eq!(
            RuntimeError::future_violation(1, "double resolve").category(),
            "future"
        );
        assert_eq!(RuntimeError::dispatch("down").category(), "dispatch");
    }

    #[test]
    fn test_compile_error_rendering() {
        let err = CompileError::new("unexpected token", 3, 7)
            .with_filename("service.tl")
            .with_source_line("(print (+ 1 ~))");
        let rendered = err.to_string();
        assert!(rendered.contains("error: unexpected token"));
        assert!(rendered.contains("service.tl:3:7"));
        assert!(rendered.contains("      ^"));
    }

    #[test]
    fn test_vm_error_conversion() {
        let err: RuntimeError = VmError::unbound("x").into();
        assert_eq!(err.category(), "vm");
    }
}
