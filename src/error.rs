use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Blocked by security policy: {0}")]
    Security(String),

    #[error("Syntax error: {message}")]
    Compilation {
        message: String,
        line: Option<u32>,
    },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Memory exhaustion: {0}")]
    Memory(String),

    #[error("Execution failed: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classification of this error in the outcome taxonomy.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Validation(_) => FailureKind::ValidationError,
            Error::Security(_) => FailureKind::SecurityError,
            Error::Compilation { .. } => FailureKind::CompilationError,
            Error::Timeout(_) => FailureKind::TimeoutError,
            Error::Memory(_) => FailureKind::MemoryError,
            Error::Runtime(_) => FailureKind::RuntimeError,
            Error::Internal(_) | Error::Io(_) => FailureKind::InternalError,
        }
    }

    /// Line number for compilation faults, when one could be extracted.
    pub fn line(&self) -> Option<u32> {
        match self {
            Error::Compilation { line, .. } => *line,
            _ => None,
        }
    }
}

/// Failure classification reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ValidationError,
    SecurityError,
    CompilationError,
    TimeoutError,
    MemoryError,
    RuntimeError,
    InternalError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::SecurityError => "security_error",
            FailureKind::CompilationError => "compilation_error",
            FailureKind::TimeoutError => "timeout_error",
            FailureKind::MemoryError => "memory_error",
            FailureKind::RuntimeError => "runtime_error",
            FailureKind::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
