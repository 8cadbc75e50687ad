//! Request orchestration: parameter validation, security validation,
//! sandbox selection, the concurrency cap, and output sanitization.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{Error, FailureKind};
use crate::sanitizer::{OutputSanitizer, MAX_OUTPUT_BYTES, MAX_OUTPUT_LINES};
use crate::sandbox::{JavaScriptSandbox, LanguageSandbox, PythonSandbox};
use crate::types::{
    Capabilities, ExecutionConfig, ExecutionOutcome, ExecutionRequest, GlobalLimits, Language,
    LanguageCapabilities, ValidationOutcome, MAX_CODE_CHARS, MAX_MEMORY_LIMIT_MB, MAX_STDIN_CHARS,
    MAX_TIMEOUT_MS, MIN_TIMEOUT_MS,
};
use crate::validator::SecurityValidator;

const JS_KEYWORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "undefined", "var", "void", "while", "with", "yield",
];

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// The single entry point the embedding front end talks to.
///
/// Holds only immutable rule tables, the two stateless sandbox variants,
/// and the concurrency semaphore; nothing here survives a request.
pub struct ExecutionDispatcher {
    config: ExecutionConfig,
    validator: SecurityValidator,
    sanitizer: OutputSanitizer,
    javascript: JavaScriptSandbox,
    python: PythonSandbox,
    semaphore: Arc<Semaphore>,
}

impl ExecutionDispatcher {
    pub fn new(config: ExecutionConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            validator: SecurityValidator::new(),
            sanitizer: OutputSanitizer::new(),
            javascript: JavaScriptSandbox::new(),
            python: PythonSandbox::new(),
            semaphore,
        }
    }

    /// Run one request end to end. Never returns `Err` and never panics;
    /// faults in the dispatch machinery itself degrade to a generic
    /// internal failure on the outcome.
    pub async fn dispatch(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let language = request.language;
        match self.dispatch_inner(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.kind() == FailureKind::InternalError {
                    error!(language = %language, "dispatch failed: {}", e);
                } else {
                    debug!(language = %language, "request refused: {}", e);
                }
                ExecutionOutcome::from_error(language, &e)
            }
        }
    }

    /// Secondary entry point: renders `bindings` as literal declarations,
    /// prepends them to the code, and dispatches normally. Injected
    /// declarations face the exact same validation as hand-written code.
    pub async fn dispatch_with_bindings(
        &self,
        mut request: ExecutionRequest,
        bindings: &Map<String, Value>,
    ) -> ExecutionOutcome {
        for name in bindings.keys() {
            if !is_shared_identifier(name) {
                let error = Error::Validation(format!(
                    "binding name '{}' is not a valid identifier in both languages",
                    name
                ));
                return ExecutionOutcome::from_error(request.language, &error);
            }
        }
        if !bindings.is_empty() {
            let declarations = render_bindings(request.language, bindings);
            request.code = format!("{}\n{}", declarations, request.code);
        }
        self.dispatch(request).await
    }

    /// Static validation with no sandbox involvement.
    pub fn validate_only(&self, language: Language, code: &str) -> ValidationOutcome {
        self.validator.validate(language, code)
    }

    /// Number of executions that could start right now.
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Static description of supported languages and limits. No side
    /// effects, no state.
    pub fn describe_capabilities(&self) -> Capabilities {
        Capabilities {
            languages: vec![
                LanguageCapabilities {
                    language: Language::JavaScript,
                    features: vec![
                        "console and print output capture".to_string(),
                        "line-based readLine/prompt input".to_string(),
                        "completion value returned as JSON".to_string(),
                        "Math, Date, JSON, String, Array, Object, RegExp".to_string(),
                    ],
                    restrictions: vec![
                        "no module loading".to_string(),
                        "no filesystem, process, or network access".to_string(),
                        "no dynamic code evaluation".to_string(),
                        "timers constrained; no repeating timers".to_string(),
                    ],
                },
                LanguageCapabilities {
                    language: Language::Python,
                    features: vec![
                        "print output capture and stdin forwarding".to_string(),
                        "trailing expression value returned as JSON".to_string(),
                        "safe standard-library utilities (math, json, re, ...)".to_string(),
                    ],
                    restrictions: vec![
                        "imports limited to an allow-list".to_string(),
                        "open() disabled".to_string(),
                        "no dynamic code evaluation".to_string(),
                        "no filesystem, process, or network access".to_string(),
                    ],
                },
            ],
            limits: GlobalLimits {
                max_code_chars: MAX_CODE_CHARS,
                max_stdin_chars: MAX_STDIN_CHARS,
                min_timeout_ms: MIN_TIMEOUT_MS,
                max_timeout_ms: MAX_TIMEOUT_MS,
                max_memory_limit_mb: MAX_MEMORY_LIMIT_MB,
                max_output_bytes: MAX_OUTPUT_BYTES,
                max_output_lines: MAX_OUTPUT_LINES,
            },
        }
    }

    async fn dispatch_inner(&self, request: &ExecutionRequest) -> Result<ExecutionOutcome, Error> {
        validate_request(request)?;

        let validation = self.validator.validate(request.language, &request.code);
        let advisory_warnings: Vec<String> = validation
            .advisories
            .iter()
            .map(|a| a.message.clone())
            .collect();

        if !validation.accepted {
            let summary = validation
                .violations
                .iter()
                .map(|v| v.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            debug!(language = %request.language, "rejected by static validation: {}", summary);
            let error = Error::Security(summary);
            let mut outcome = ExecutionOutcome::from_error(request.language, &error);
            if let Some(failure) = outcome.failure.as_mut() {
                failure.detail = Some(
                    validation
                        .violations
                        .iter()
                        .map(|v| format!("{}: {}", v.rule, v.message))
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
            }
            outcome.warnings = advisory_warnings;
            return Ok(outcome);
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| Error::Internal(format!("execution permit unavailable: {}", e)))?;

        let timeout =
            Duration::from_millis(request.timeout_ms.unwrap_or(self.config.default_timeout_ms));
        let memory_limit_mb = request
            .memory_limit_mb
            .unwrap_or(self.config.default_memory_limit_mb);

        let sandbox: &dyn LanguageSandbox = match request.language {
            Language::JavaScript => &self.javascript,
            Language::Python => &self.python,
        };

        let mut outcome = sandbox
            .run(&request.code, request.stdin.as_deref(), timeout, memory_limit_mb)
            .await;

        outcome.warnings = advisory_warnings;
        let outcome = self.sanitize_outcome(outcome);

        match &outcome.failure {
            None => info!(
                language = %request.language,
                elapsed_ms = outcome.elapsed_ms,
                "execution completed"
            ),
            Some(failure) => info!(
                language = %request.language,
                elapsed_ms = outcome.elapsed_ms,
                kind = %failure.kind,
                "execution failed"
            ),
        }

        Ok(outcome)
    }

    /// Sanitization must never discard a finished run: if any step fails,
    /// the affected field passes through unsanitized.
    fn sanitize_outcome(&self, mut outcome: ExecutionOutcome) -> ExecutionOutcome {
        match try_sanitize(&self.sanitizer, &outcome) {
            Ok(sanitized) => {
                outcome.stdout = sanitized.stdout;
                outcome.stderr = sanitized.stderr;
                outcome.return_value = sanitized.return_value;
                if let Some(failure) = outcome.failure.as_mut() {
                    failure.message = self.sanitizer.sanitize_error(&failure.message);
                    failure.stack = self.sanitizer.sanitize_stack(&failure.stack);
                    if let Some(detail) = failure.detail.take() {
                        failure.detail = Some(self.sanitizer.sanitize_error(&detail));
                    }
                }
                outcome
                    .warnings
                    .extend(self.sanitizer.validate_output_safety(&outcome.stdout));
                outcome
            }
            Err(fault) => {
                warn!("sanitization failed, returning output unsanitized: {}", fault);
                outcome
            }
        }
    }
}

struct SanitizedStreams {
    stdout: String,
    stderr: String,
    return_value: Option<Value>,
}

fn try_sanitize(
    sanitizer: &OutputSanitizer,
    outcome: &ExecutionOutcome,
) -> Result<SanitizedStreams, Error> {
    // Probing serializability up front is what can actually fail here;
    // the text transforms themselves are total.
    if let Some(value) = &outcome.return_value {
        serde_json::to_string(value)
            .map_err(|e| Error::Internal(format!("return value not serializable: {}", e)))?;
    }
    Ok(SanitizedStreams {
        stdout: sanitizer.sanitize_output(&outcome.stdout),
        stderr: sanitizer.sanitize_output(&outcome.stderr),
        return_value: outcome
            .return_value
            .as_ref()
            .map(|v| sanitizer.sanitize_return_value(v)),
    })
}

fn validate_request(request: &ExecutionRequest) -> Result<(), Error> {
    if request.code.trim().is_empty() {
        return Err(Error::Validation("code must not be empty".to_string()));
    }
    if request.code.chars().count() > MAX_CODE_CHARS {
        return Err(Error::Validation(format!(
            "code exceeds {} characters",
            MAX_CODE_CHARS
        )));
    }
    if let Some(stdin) = &request.stdin {
        if stdin.chars().count() > MAX_STDIN_CHARS {
            return Err(Error::Validation(format!(
                "stdin exceeds {} characters",
                MAX_STDIN_CHARS
            )));
        }
    }
    if let Some(timeout_ms) = request.timeout_ms {
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(Error::Validation(format!(
                "timeout_ms must be between {} and {}",
                MIN_TIMEOUT_MS, MAX_TIMEOUT_MS
            )));
        }
    }
    if let Some(memory_limit_mb) = request.memory_limit_mb {
        if memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(Error::Validation(format!(
                "memory_limit_mb must be at most {}",
                MAX_MEMORY_LIMIT_MB
            )));
        }
    }
    Ok(())
}

/// A binding name must parse as an identifier in both languages and must
/// not collide with either keyword set.
fn is_shared_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return false;
    }
    !JS_KEYWORDS.contains(&name) && !PYTHON_KEYWORDS.contains(&name)
}

fn render_bindings(language: Language, bindings: &Map<String, Value>) -> String {
    bindings
        .iter()
        .map(|(name, value)| match language {
            Language::JavaScript => format!(
                "const {} = {};",
                name,
                serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
            ),
            Language::Python => format!("{} = {}", name, render_python_literal(value)),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_python_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        // JSON string escapes are valid Python string-literal escapes.
        Value::String(_) => serde_json::to_string(value).unwrap_or_else(|_| "''".to_string()),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(render_python_literal).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Object(map) => {
            let rendered: Vec<String> = map
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}: {}",
                        serde_json::to_string(k).unwrap_or_else(|_| "''".to_string()),
                        render_python_literal(v)
                    )
                })
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shared_identifier_rules() {
        assert!(is_shared_identifier("value"));
        assert!(is_shared_identifier("_total_2"));
        assert!(!is_shared_identifier(""));
        assert!(!is_shared_identifier("2fast"));
        assert!(!is_shared_identifier("has-dash"));
        // Keywords in either language are refused.
        assert!(!is_shared_identifier("class"));
        assert!(!is_shared_identifier("lambda"));
        assert!(!is_shared_identifier("typeof"));
        assert!(!is_shared_identifier("None"));
    }

    #[test]
    fn test_python_literal_rendering() {
        assert_eq!(render_python_literal(&json!(null)), "None");
        assert_eq!(render_python_literal(&json!(true)), "True");
        assert_eq!(render_python_literal(&json!(3.5)), "3.5");
        assert_eq!(render_python_literal(&json!("hi")), "\"hi\"");
        assert_eq!(
            render_python_literal(&json!([1, false, "x"])),
            "[1, False, \"x\"]"
        );
        assert_eq!(
            render_python_literal(&json!({"a": null})),
            "{\"a\": None}"
        );
    }

    #[test]
    fn test_binding_rendering_per_language() {
        let mut bindings = Map::new();
        bindings.insert("name".to_string(), json!("Alice"));
        bindings.insert("count".to_string(), json!(3));

        let js = render_bindings(Language::JavaScript, &bindings);
        assert!(js.contains("const name = \"Alice\";"));
        assert!(js.contains("const count = 3;"));

        let py = render_bindings(Language::Python, &bindings);
        assert!(py.contains("name = \"Alice\""));
        assert!(py.contains("count = 3"));
    }

    #[test]
    fn test_request_validation_bounds() {
        let empty = ExecutionRequest::new(Language::Python, "   \n  ");
        let error = validate_request(&empty).unwrap_err();
        assert!(error.to_string().contains("empty"));

        let slow = ExecutionRequest::new(Language::Python, "print(1)").with_timeout_ms(50);
        assert!(validate_request(&slow).is_err());

        let fine = ExecutionRequest::new(Language::Python, "print(1)").with_timeout_ms(1000);
        assert!(validate_request(&fine).is_ok());

        let heavy =
            ExecutionRequest::new(Language::Python, "print(1)").with_memory_limit_mb(1024);
        assert!(validate_request(&heavy).is_err());
    }
}
