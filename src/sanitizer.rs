//! Sanitization of everything that crosses back out of a sandbox.
//!
//! Pure text/value transforms: size and line capping, control-sequence
//! stripping, credential and home-path redaction, stack-trace scrubbing,
//! and depth-limited return-value copying. Sanitization is idempotent;
//! running it twice yields the same result.

use regex::Regex;
use serde_json::Value;

/// Output larger than this is truncated with an explicit marker.
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;
/// Output with more lines than this is truncated with an explicit marker.
pub const MAX_OUTPUT_LINES: usize = 1_000;
/// Ceiling on sanitized error message length, in characters.
pub const MAX_ERROR_CHARS: usize = 2_000;
/// Stack traces are cut to this many frames.
pub const MAX_STACK_FRAMES: usize = 10;
/// Return values deeper than this collapse to a marker.
pub const MAX_VALUE_DEPTH: usize = 16;

pub const REDACTION_MARKER: &str = "[redacted]";
pub const TRUNCATION_MARKER: &str = "[output truncated]";
pub const DEPTH_MARKER: &str = "[max depth exceeded]";

/// Frames mentioning any of these belong to host tooling, not user code.
const INTERNAL_FRAME_MARKERS: &[&str] = &[
    "deno_core",
    "ext:",
    "<sandbox-prelude>",
    "site-packages",
    ".rs:",
    "tokio",
    "/tmp/",
];

pub struct OutputSanitizer {
    control_sequences: Regex,
    credentials: Vec<Regex>,
    home_paths: Regex,
    ip_addresses: Regex,
    urls: Regex,
    absolute_paths: Regex,
}

impl OutputSanitizer {
    pub fn new() -> Self {
        Self {
            // CSI/OSC escape sequences plus stray C0 controls other than \n and \t.
            control_sequences: Regex::new(
                r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07|[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]",
            )
            .unwrap(),
            credentials: vec![
                Regex::new(r"(?i)\b(password|passwd|pwd)\s*[=:]\s*\S+").unwrap(),
                Regex::new(r"(?i)\b(token|secret|api[_-]?key)\s*[=:]\s*\S+").unwrap(),
                Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").unwrap(),
            ],
            home_paths: Regex::new(r"(?:/home/[A-Za-z0-9._-]+|/Users/[A-Za-z0-9._-]+|/root)\b")
                .unwrap(),
            ip_addresses: Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").unwrap(),
            urls: Regex::new(r"https?://\S+").unwrap(),
            absolute_paths: Regex::new(r"(?:/[A-Za-z0-9._-]+){2,}").unwrap(),
        }
    }

    /// Bound and scrub a captured output stream.
    pub fn sanitize_output(&self, text: &str) -> String {
        let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
        let stripped = self.control_sequences.replace_all(&normalized, "");
        let mut redacted = stripped.into_owned();
        for pattern in &self.credentials {
            redacted = pattern
                .replace_all(&redacted, |caps: &regex::Captures<'_>| {
                    match caps.get(1) {
                        Some(label) => format!("{}={}", label.as_str(), REDACTION_MARKER),
                        None => REDACTION_MARKER.to_string(),
                    }
                })
                .into_owned();
        }
        redacted = self
            .home_paths
            .replace_all(&redacted, REDACTION_MARKER)
            .into_owned();

        let mut bounded = cap_lines(&redacted, MAX_OUTPUT_LINES);
        bounded = cap_bytes(&bounded, MAX_OUTPUT_BYTES);
        bounded
    }

    /// Scrub an error message and cap its length.
    pub fn sanitize_error(&self, message: &str) -> String {
        let scrubbed = self.sanitize_output(message);
        if scrubbed.chars().count() <= MAX_ERROR_CHARS {
            return scrubbed;
        }
        let mut capped: String = scrubbed.chars().take(MAX_ERROR_CHARS).collect();
        capped.push_str("...");
        capped
    }

    /// Drop host-internal frames, scrub the rest, keep at most
    /// [`MAX_STACK_FRAMES`].
    pub fn sanitize_stack(&self, frames: &[String]) -> Vec<String> {
        frames
            .iter()
            .filter(|frame| {
                !INTERNAL_FRAME_MARKERS
                    .iter()
                    .any(|marker| frame.contains(marker))
            })
            .take(MAX_STACK_FRAMES)
            .map(|frame| self.sanitize_error(frame))
            .collect()
    }

    /// Depth-limited copy of a return value. Strings inside are redacted;
    /// anything nested past [`MAX_VALUE_DEPTH`] collapses to a marker.
    pub fn sanitize_return_value(&self, value: &Value) -> Value {
        self.sanitize_value_at(value, 0)
    }

    fn sanitize_value_at(&self, value: &Value, depth: usize) -> Value {
        if depth >= MAX_VALUE_DEPTH {
            return Value::String(DEPTH_MARKER.to_string());
        }
        match value {
            Value::String(s) => {
                let mut redacted = s.clone();
                for pattern in &self.credentials {
                    redacted = pattern
                        .replace_all(&redacted, |caps: &regex::Captures<'_>| {
                            match caps.get(1) {
                                Some(label) => {
                                    format!("{}={}", label.as_str(), REDACTION_MARKER)
                                }
                                None => REDACTION_MARKER.to_string(),
                            }
                        })
                        .into_owned();
                }
                Value::String(redacted)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.sanitize_value_at(item, depth + 1))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.sanitize_value_at(v, depth + 1)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Advisory-only scan of output for things that look like they should
    /// not be leaving the boundary. Never blocks.
    pub fn validate_output_safety(&self, text: &str) -> Vec<String> {
        let mut flags = Vec::new();
        if self.credentials.iter().any(|p| p.is_match(text)) {
            flags.push("output may contain credentials".to_string());
        }
        if self.absolute_paths.is_match(text) {
            flags.push("output may contain filesystem paths".to_string());
        }
        if self.ip_addresses.is_match(text) {
            flags.push("output may contain IP addresses".to_string());
        }
        if self.urls.is_match(text) {
            flags.push("output may contain URLs".to_string());
        }
        flags
    }
}

impl Default for OutputSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

fn cap_lines(text: &str, max_lines: usize) -> String {
    if text.lines().count() <= max_lines {
        return text.to_string();
    }
    let kept: Vec<&str> = text.lines().take(max_lines).collect();
    format!("{}\n{}", kept.join("\n"), TRUNCATION_MARKER)
}

fn cap_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n{}", &text[..cut], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sanitizer() -> OutputSanitizer {
        OutputSanitizer::new()
    }

    #[test]
    fn test_plain_output_unchanged() {
        assert_eq!(sanitizer().sanitize_output("Hello, World!"), "Hello, World!");
        assert_eq!(sanitizer().sanitize_output("héllo 世界"), "héllo 世界");
    }

    #[test]
    fn test_line_endings_normalized() {
        assert_eq!(sanitizer().sanitize_output("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_control_sequences_stripped() {
        assert_eq!(
            sanitizer().sanitize_output("\x1b[31mred\x1b[0m and \x07bell"),
            "red and bell"
        );
    }

    #[test]
    fn test_credentials_redacted() {
        let out = sanitizer().sanitize_output("password=hunter2 token: abc123");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("abc123"));
        assert!(out.contains(REDACTION_MARKER));

        let out = sanitizer().sanitize_output("Authorization: Bearer eyJhbGciOi");
        assert!(!out.contains("eyJhbGciOi"));
    }

    #[test]
    fn test_home_paths_redacted() {
        let out = sanitizer().sanitize_output("saved to /home/alice/data.txt");
        assert!(!out.contains("alice"));
        assert!(out.contains(REDACTION_MARKER));
    }

    #[test]
    fn test_byte_cap_truncates_with_marker() {
        let big = "x".repeat(MAX_OUTPUT_BYTES + 100);
        let out = sanitizer().sanitize_output(&big);
        assert!(out.len() < big.len());
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_line_cap_truncates_with_marker() {
        let many = vec!["line"; MAX_OUTPUT_LINES + 5].join("\n");
        let out = sanitizer().sanitize_output(&many);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert_eq!(out.lines().count(), MAX_OUTPUT_LINES + 1);
    }

    #[test]
    fn test_stack_drops_internal_frames() {
        let frames = vec![
            "at userFn (<code>:3:5)".to_string(),
            "at ext:core/01_core.js:100".to_string(),
            "at deno_core::runtime".to_string(),
        ];
        let out = sanitizer().sanitize_stack(&frames);
        assert_eq!(out.len(), 1);
        assert!(out[0].contains("userFn"));
    }

    #[test]
    fn test_stack_frame_cap() {
        let frames: Vec<String> = (0..30).map(|i| format!("at frame{} (<code>)", i)).collect();
        assert_eq!(sanitizer().sanitize_stack(&frames).len(), MAX_STACK_FRAMES);
    }

    #[test]
    fn test_return_value_depth_cap() {
        let mut value = json!("leaf");
        for _ in 0..(MAX_VALUE_DEPTH + 4) {
            value = json!([value]);
        }
        let sanitized = sanitizer().sanitize_return_value(&value);
        assert!(serde_json::to_string(&sanitized).unwrap().contains(DEPTH_MARKER));
    }

    #[test]
    fn test_return_value_sanitization_idempotent() {
        let value = json!({
            "note": "password=hunter2",
            "nested": {"items": [1, 2, {"deep": "ok"}]},
        });
        let once = sanitizer().sanitize_return_value(&value);
        let twice = sanitizer().sanitize_return_value(&once);
        assert_eq!(once, twice);
        assert!(!serde_json::to_string(&once).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_output_safety_flags() {
        let flags = sanitizer().validate_output_safety("fetch http://10.0.0.1/admin");
        assert!(flags.iter().any(|f| f.contains("IP")));
        assert!(flags.iter().any(|f| f.contains("URL")));
        assert!(sanitizer().validate_output_safety("plain text").is_empty());
    }
}
