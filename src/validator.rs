//! Static, per-language validation of submitted code.
//!
//! Two ordered rule tables per language: blocking rules (host module
//! access, dynamic code evaluation, unbounded loop literals) and advisory
//! rules (patterns correlated with resource abuse). Every rule is always
//! evaluated so a caller sees all violations in one pass. This is textual
//! analysis only; it does not see through obfuscation or indirection.

use regex::Regex;

use crate::types::{Language, RuleMatch, ValidationOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Blocking,
    Advisory,
}

struct Rule {
    id: &'static str,
    severity: Severity,
    pattern: Regex,
    message: &'static str,
}

struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    fn compile(table: &[(&'static str, Severity, &'static str, &'static str)]) -> Self {
        let rules = table
            .iter()
            .map(|&(id, severity, pattern, message)| Rule {
                id,
                severity,
                pattern: Regex::new(pattern).unwrap(),
                message,
            })
            .collect();
        Self { rules }
    }

    fn evaluate(&self, code: &str) -> ValidationOutcome {
        let mut violations = Vec::new();
        let mut advisories = Vec::new();

        for rule in &self.rules {
            let Some(captures) = rule.pattern.captures(code) else {
                continue;
            };
            // Capture group 1, when present, names the offending module or
            // primitive so the message points at the exact culprit.
            let message = match captures.get(1) {
                Some(name) => format!("{}: {}", rule.message, name.as_str()),
                None => rule.message.to_string(),
            };
            let matched = RuleMatch {
                rule: rule.id.to_string(),
                message,
            };
            match rule.severity {
                Severity::Blocking => violations.push(matched),
                Severity::Advisory => advisories.push(matched),
            }
        }

        ValidationOutcome::new(violations, advisories)
    }
}

const JAVASCRIPT_RULES: &[(&str, Severity, &str, &str)] = &[
    (
        "js-host-module",
        Severity::Blocking,
        r#"require\s*\(\s*['"](fs|child_process|net|http|https|os|path|vm|worker_threads|cluster|dns|tls|dgram)['"]"#,
        "require of a host module is not permitted",
    ),
    (
        "js-module-syntax",
        Severity::Blocking,
        r#"(?m)^\s*(?:import\s+[\w{},*\s]+\s+from\s+['"]|import\s*\(|export\s+)"#,
        "module import/export syntax is not permitted",
    ),
    (
        "js-process-access",
        Severity::Blocking,
        r"\b(process)\s*\.",
        "host process object is not accessible",
    ),
    (
        "js-host-bridge",
        Severity::Blocking,
        r"\b(Deno)\s*\.",
        "host runtime bridge is not accessible",
    ),
    (
        "js-dynamic-eval",
        Severity::Blocking,
        r"\b(eval)\s*\(",
        "dynamic code evaluation is not permitted",
    ),
    (
        "js-function-constructor",
        Severity::Blocking,
        r"\bnew\s+(Function)\s*\(|\b(?:Function)\s*\(",
        "the Function constructor is not permitted",
    ),
    (
        "js-unbounded-loop",
        Severity::Blocking,
        r"while\s*\(\s*true\s*\)",
        "unbounded loop literal",
    ),
    (
        "js-large-allocation",
        Severity::Advisory,
        r"new\s+Array\s*\(\s*\d{7,}",
        "very large array allocation",
    ),
    (
        "js-large-repetition",
        Severity::Advisory,
        r"\.repeat\s*\(\s*\d{6,}",
        "very large string repetition",
    ),
    (
        "js-high-iteration",
        Severity::Advisory,
        r"for\s*\([^)]*[<>]=?\s*\d{8,}",
        "high iteration bound",
    ),
];

const PYTHON_RULES: &[(&str, Severity, &str, &str)] = &[
    (
        "py-host-module",
        Severity::Blocking,
        r"(?m)^\s*(?:import|from)\s+(os|sys|subprocess|socket|shutil|pathlib|tempfile|io|ctypes|importlib|multiprocessing|threading|signal|resource|ssl|http|urllib|ftplib|smtplib|asyncio|pickle|marshal)\b",
        "import of a denied module",
    ),
    (
        "py-file-open",
        Severity::Blocking,
        r"\b(open)\s*\(",
        "raw file open is not permitted",
    ),
    (
        "py-dynamic-eval",
        Severity::Blocking,
        r"\b(eval|exec|compile)\s*\(",
        "dynamic code evaluation is not permitted",
    ),
    (
        "py-dunder-import",
        Severity::Blocking,
        r"(__import__)",
        "direct use of the import machinery is not permitted",
    ),
    (
        "py-unbounded-loop",
        Severity::Blocking,
        r"while\s+True\s*:",
        "unbounded loop literal",
    ),
    (
        "py-high-iteration",
        Severity::Advisory,
        r"range\s*\(\s*(?:\d{8,}|10\s*\*\*\s*\d)",
        "high iteration bound",
    ),
    (
        "py-large-repetition",
        Severity::Advisory,
        r"\*\s*(?:\d{6,}|10\s*\*\*\s*[6-9])",
        "very large repetition count",
    ),
];

/// Stateless rule evaluation over source text. The tables are compiled once
/// at construction and never change; concurrent reads need no locking.
pub struct SecurityValidator {
    javascript: RuleSet,
    python: RuleSet,
}

impl SecurityValidator {
    pub fn new() -> Self {
        Self {
            javascript: RuleSet::compile(JAVASCRIPT_RULES),
            python: RuleSet::compile(PYTHON_RULES),
        }
    }

    /// Classify `code` as accept/reject. Pure function of its inputs.
    pub fn validate(&self, language: Language, code: &str) -> ValidationOutcome {
        match language {
            Language::JavaScript => self.javascript.evaluate(code),
            Language::Python => self.python.evaluate(code),
        }
    }
}

impl Default for SecurityValidator {
    fn default() -> Self {
        Self::new()
    }
}
