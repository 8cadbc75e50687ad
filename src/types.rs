use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::error::{Error, FailureKind};

/// Maximum length of submitted code, in characters.
pub const MAX_CODE_CHARS: usize = 50_000;
/// Maximum length of request stdin, in characters.
pub const MAX_STDIN_CHARS: usize = 10_000;
/// Smallest accepted per-request timeout.
pub const MIN_TIMEOUT_MS: u64 = 100;
/// Largest accepted per-request timeout.
pub const MAX_TIMEOUT_MS: u64 = 60_000;
/// Largest accepted per-request memory limit.
pub const MAX_MEMORY_LIMIT_MB: u64 = 512;

/// Supported snippet languages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::JavaScript => "javascript",
            Language::Python => "python",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "javascript" | "js" => Ok(Language::JavaScript),
            "python" | "py" => Ok(Language::Python),
            _ => Err(format!("Unsupported language: {}", s)),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single snippet execution request. Immutable once validated by the
/// dispatcher; nothing mutates it after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Snippet language
    pub language: Language,
    /// Source code to execute
    pub code: String,
    /// Input replayed to the snippet line by line
    #[serde(default)]
    pub stdin: Option<String>,
    /// Wall-clock budget in milliseconds (default from config)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Advisory memory ceiling in megabytes (default from config)
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// Reserved; both sandboxes refuse network access regardless
    #[serde(default)]
    pub networking_enabled: bool,
}

impl ExecutionRequest {
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            language,
            code: code.into(),
            stdin: None,
            timeout_ms: None,
            memory_limit_mb: None,
            networking_enabled: false,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_memory_limit_mb(mut self, memory_limit_mb: u64) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }
}

/// Process-wide execution defaults and ceilings. Populated by the embedding
/// front end; only defaults live here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout applied when the request carries none
    pub default_timeout_ms: u64,
    /// Memory limit applied when the request carries none
    pub default_memory_limit_mb: u64,
    /// Maximum number of concurrently running sandboxes
    pub max_concurrent: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            default_memory_limit_mb: 128,
            max_concurrent: 10,
        }
    }
}

/// One matched validation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Stable rule identifier
    pub rule: String,
    /// Human-readable description of the match
    pub message: String,
}

/// Result of static validation. `accepted` holds exactly when no blocking
/// rule matched; advisories never block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    pub violations: Vec<RuleMatch>,
    pub advisories: Vec<RuleMatch>,
}

impl ValidationOutcome {
    pub fn new(violations: Vec<RuleMatch>, advisories: Vec<RuleMatch>) -> Self {
        Self {
            accepted: violations.is_empty(),
            violations,
            advisories,
        }
    }
}

/// Failure detail attached to an unsuccessful outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    #[serde(rename = "type")]
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stack: Vec<String>,
}

/// Result of one snippet execution.
///
/// Created empty at sandbox entry, populated as the run proceeds, frozen
/// before sanitization and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub succeeded: bool,
    pub language: Language,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_value: Option<Value>,
    pub elapsed_ms: u64,
    pub estimated_memory_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

impl ExecutionOutcome {
    pub fn success(
        language: Language,
        stdout: String,
        stderr: String,
        return_value: Option<Value>,
        elapsed_ms: u64,
        estimated_memory_bytes: u64,
    ) -> Self {
        Self {
            succeeded: true,
            language,
            stdout,
            stderr,
            return_value,
            elapsed_ms,
            estimated_memory_bytes,
            failure: None,
            warnings: Vec::new(),
        }
    }

    /// Build a failed outcome from a classified error, keeping whatever
    /// output was captured before the fault.
    pub fn failure(
        language: Language,
        error: &Error,
        stdout: String,
        stderr: String,
        elapsed_ms: u64,
        estimated_memory_bytes: u64,
    ) -> Self {
        let kind = error.kind();
        let message = match kind {
            // Host infrastructure faults must not leak internals.
            FailureKind::InternalError => "internal error during execution".to_string(),
            _ => error.to_string(),
        };
        Self {
            succeeded: false,
            language,
            stdout,
            stderr,
            return_value: None,
            elapsed_ms,
            estimated_memory_bytes,
            failure: Some(Failure {
                kind,
                message,
                detail: None,
                line: error.line(),
                stack: Vec::new(),
            }),
            warnings: Vec::new(),
        }
    }

    pub fn from_error(language: Language, error: &Error) -> Self {
        Self::failure(language, error, String::new(), String::new(), 0, 0)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Static description of what the crate supports, returned by
/// `ExecutionDispatcher::describe_capabilities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    pub languages: Vec<LanguageCapabilities>,
    pub limits: GlobalLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageCapabilities {
    pub language: Language,
    pub features: Vec<String>,
    pub restrictions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalLimits {
    pub max_code_chars: usize,
    pub max_stdin_chars: usize,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_memory_limit_mb: u64,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_str() {
        assert_eq!("javascript".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("js".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("python".parse::<Language>(), Ok(Language::Python));
        assert_eq!("py".parse::<Language>(), Ok(Language::Python));
        assert!("ruby".parse::<Language>().is_err());
    }

    #[test]
    fn test_validation_outcome_invariant() {
        let clean = ValidationOutcome::new(vec![], vec![]);
        assert!(clean.accepted);

        let rejected = ValidationOutcome::new(
            vec![RuleMatch {
                rule: "js-dynamic-eval".to_string(),
                message: "dynamic code evaluation is not permitted".to_string(),
            }],
            vec![],
        );
        assert!(!rejected.accepted);
    }

    #[test]
    fn test_internal_failure_message_is_generic() {
        let outcome = ExecutionOutcome::from_error(
            Language::Python,
            &Error::Internal("sanitizer hit a bad offset in /srv/host".to_string()),
        );
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::InternalError);
        assert!(!failure.message.contains("/srv/host"));
    }
}
