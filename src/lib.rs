//! # Snippet Execution Sandbox
//!
//! Executes untrusted, short-lived JavaScript and Python snippets inside
//! bounded, revocable execution contexts and returns captured output,
//! errors, and approximate resource usage.
//!
//! JavaScript runs in a fresh in-process V8 isolate per request; Python
//! runs as a guarded external process. Before anything executes, static
//! rule tables classify the source text; during execution, a wall-clock
//! deadline is enforced by racing the run against an independent timer;
//! afterwards, everything crossing back out is sanitized.
//!
//! This is a best-effort application-level sandbox. Pattern rejection and
//! import guarding are bypassable by a sufficiently motivated adversary;
//! deployments needing hard guarantees must layer OS-level isolation
//! (restricted users, namespaces, cgroups) underneath.

mod dispatcher;
mod error;
mod guard;
mod sandbox;
mod sanitizer;
#[cfg(test)]
mod tests;
mod types;
mod validator;

pub use dispatcher::ExecutionDispatcher;
pub use error::{Error, FailureKind};
pub use guard::ResourceGuard;
pub use sandbox::{JavaScriptSandbox, LanguageSandbox, PythonSandbox};
pub use sanitizer::OutputSanitizer;
pub use types::{
    Capabilities, ExecutionConfig, ExecutionOutcome, ExecutionRequest, Failure, GlobalLimits,
    Language, LanguageCapabilities, RuleMatch, ValidationOutcome,
};
pub use validator::SecurityValidator;

/// Result type for sandbox operations
pub type Result<T> = std::result::Result<T, Error>;
