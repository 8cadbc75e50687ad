//! Per-language sandbox variants.
//!
//! One contract, two mechanisms: JavaScript runs in an in-process V8
//! isolate, Python in an external child process. A variant is selected by
//! [`Language`] at dispatch; both hold no per-request state and are safe
//! to share across concurrent runs.

mod javascript;
mod python;

pub use javascript::JavaScriptSandbox;
pub use python::PythonSandbox;

use async_trait::async_trait;
use std::time::Duration;

use crate::types::{ExecutionOutcome, Language};

#[async_trait]
pub trait LanguageSandbox: Send + Sync {
    fn language(&self) -> Language;

    /// Run one snippet. Every internal fault is caught and classified
    /// before crossing back; this never panics and never returns `Err`.
    async fn run(
        &self,
        code: &str,
        stdin: Option<&str>,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> ExecutionOutcome;
}

/// Split request stdin into the lines replayed to the snippet, one per
/// read. A trailing newline does not produce a phantom empty line.
pub(crate) fn stdin_lines(stdin: Option<&str>) -> Vec<String> {
    stdin
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stdin_lines_split() {
        assert_eq!(stdin_lines(Some("a\nb\n")), vec!["a", "b"]);
        assert_eq!(stdin_lines(Some("Alice")), vec!["Alice"]);
        assert!(stdin_lines(None).is_empty());
    }
}
