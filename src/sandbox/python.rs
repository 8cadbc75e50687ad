//! External-process sandbox for Python snippets.
//!
//! User code is embedded in a generated wrapper script that replaces the
//! interpreter's import hook with one consulting an allow-list and a
//! deny-list (anything unlisted is denied), refuses `open` and nested
//! dynamic evaluation, and re-emits captured streams under per-run
//! sentinel prefixes so user output can be split from interpreter
//! diagnostics. The wrapper is written to a uniquely
//! named temporary file, run as a child process with piped stdio, and
//! raced against the deadline; on expiry the child is killed. The
//! artifact is removed on every exit path.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::guard::{child_peak_rss_bytes, estimate_memory_cost, ResourceGuard};
use crate::sandbox::LanguageSandbox;
use crate::types::{ExecutionOutcome, Language};

const INTERPRETER_CANDIDATES: &[&str] = &[
    "python3",
    "python3.13",
    "python3.12",
    "python3.11",
    "python3.10",
    "python",
];

// Wrapper exit statuses, matched by the classifier below.
const STATUS_SECURITY: i32 = 3;
const STATUS_SYNTAX: i32 = 4;
const STATUS_RUNTIME: i32 = 5;
const STATUS_MEMORY: i32 = 6;

const WRAPPER_TEMPLATE: &str = r#"
import ast as _ast
import builtins as _builtins
import io as _io
import json as _json
import sys as _sys
import traceback as _traceback

_ALLOWED = frozenset((
    "abc", "array", "base64", "bisect", "calendar", "cmath", "collections",
    "copy", "dataclasses", "datetime", "decimal", "enum", "fractions",
    "functools", "hashlib", "heapq", "hmac", "itertools", "json", "math",
    "numbers", "operator", "random", "re", "secrets", "statistics",
    "string", "struct", "textwrap", "time", "typing", "unicodedata", "uuid",
))
_DENIED = frozenset((
    "asyncio", "builtins", "code", "codeop", "concurrent", "ctypes", "dbm",
    "fcntl", "ftplib", "gc", "grp", "http", "imaplib", "importlib",
    "inspect", "io", "marshal", "mmap", "multiprocessing", "os", "pathlib",
    "pickle", "pkgutil", "platform", "poplib", "pty", "pwd", "resource",
    "select", "selectors", "shelve", "shutil", "signal", "smtplib",
    "socket", "ssl", "subprocess", "sys", "sysconfig", "telnetlib",
    "tempfile", "threading", "tty", "urllib", "webbrowser",
))

_real_import = _builtins.__import__
_real_eval = _builtins.eval
_real_exec = _builtins.exec
_real_compile = _builtins.compile


class _SandboxAccessError(ImportError):
    pass


def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    root = name.partition(".")[0]
    if root in _DENIED:
        raise _SandboxAccessError("module '%s' is denied" % root)
    if root not in _ALLOWED:
        raise _SandboxAccessError("module '%s' is not on the allow-list" % root)
    return _real_import(name, globals, locals, fromlist, level)


def _refuse_open(*_args, **_kwargs):
    raise _SandboxAccessError("open() is disabled")


def _refuse_dynamic(*_args, **_kwargs):
    raise _SandboxAccessError("dynamic code execution is disabled")


_builtins.__import__ = _guarded_import
_builtins.open = _refuse_open
_builtins.eval = _refuse_dynamic
_builtins.exec = _refuse_dynamic
_builtins.compile = _refuse_dynamic

_TOKEN = "@@TOKEN@@"
_CODE = @@CODE@@

_out = _io.StringIO()
_err = _io.StringIO()
_sys.stdout = _out
_sys.stderr = _err

_status = 0
_value = None
_has_value = False
try:
    _tree = _ast.parse(_CODE, "<sandbox>", "exec")
    _trailing = None
    if _tree.body and isinstance(_tree.body[-1], _ast.Expr):
        _trailing = _ast.Expression(_tree.body.pop().value)
    _scope = {"__name__": "__main__", "__builtins__": _builtins}
    _real_exec(_real_compile(_tree, "<sandbox>", "exec"), _scope)
    if _trailing is not None:
        _ast.fix_missing_locations(_trailing)
        _value = _real_eval(_real_compile(_trailing, "<sandbox>", "eval"), _scope)
        _has_value = _value is not None
except _SandboxAccessError as _fault:
    _status = @@STATUS_SECURITY@@
    _err.write("blocked: %s\n" % _fault)
except SyntaxError as _fault:
    _status = @@STATUS_SYNTAX@@
    _err.write("syntax:%d:%s\n" % (_fault.lineno or 0, _fault.msg))
except MemoryError:
    _status = @@STATUS_MEMORY@@
    _err.write("memory exhausted\n")
except BaseException as _fault:
    _status = @@STATUS_RUNTIME@@
    for _frame in _traceback.format_exception(type(_fault), _fault, _fault.__traceback__, limit=10):
        _err.write(_frame)
finally:
    _sys.stdout = _sys.__stdout__
    _sys.stderr = _sys.__stderr__

for _line in _out.getvalue().splitlines():
    _sys.stdout.write("%s|OUT|%s\n" % (_TOKEN, _line))
for _line in _err.getvalue().splitlines():
    _sys.stdout.write("%s|ERR|%s\n" % (_TOKEN, _line))
if _has_value:
    try:
        _sys.stdout.write("%s|RET|%s\n" % (_TOKEN, _json.dumps(_value)))
    except (TypeError, ValueError):
        _sys.stdout.write("%s|RET|%s\n" % (_TOKEN, _json.dumps({"__type__": type(_value).__name__})))
_sys.exit(_status)
"#;

struct SentinelStreams {
    stdout: String,
    stderr: String,
    return_value: Option<Value>,
}

pub struct PythonSandbox {
    interpreter: OnceCell<PathBuf>,
    line_pattern: Regex,
}

impl PythonSandbox {
    pub fn new() -> Self {
        Self {
            interpreter: OnceCell::new(),
            line_pattern: Regex::new(r"line (\d+)").unwrap(),
        }
    }

    /// First candidate that reports a working version string wins; the
    /// result is cached for the life of the sandbox.
    async fn resolve_interpreter(&self) -> Result<&PathBuf, Error> {
        self.interpreter
            .get_or_try_init(|| async {
                for candidate in INTERPRETER_CANDIDATES {
                    let Ok(path) = which::which(candidate) else {
                        continue;
                    };
                    let probe = Command::new(&path).arg("--version").output().await;
                    let Ok(output) = probe else { continue };
                    if !output.status.success() {
                        continue;
                    }
                    let banner = if output.stdout.is_empty() {
                        String::from_utf8_lossy(&output.stderr).into_owned()
                    } else {
                        String::from_utf8_lossy(&output.stdout).into_owned()
                    };
                    if banner.trim_start().starts_with("Python") {
                        debug!(interpreter = %path.display(), banner = %banner.trim(), "resolved interpreter");
                        return Ok(path);
                    }
                }
                Err(Error::Runtime(format!(
                    "no working Python interpreter found (tried {})",
                    INTERPRETER_CANDIDATES.join(", ")
                )))
            })
            .await
    }

    fn classify_exit(
        &self,
        status_code: Option<i32>,
        user_err: &[String],
        raw_stderr: &str,
        timeout: Duration,
    ) -> Error {
        match status_code {
            Some(STATUS_SECURITY) => {
                let message = user_err
                    .first()
                    .map(|line| line.trim_start_matches("blocked: ").to_string())
                    .unwrap_or_else(|| "blocked by the module guard".to_string());
                Error::Security(message)
            }
            Some(STATUS_SYNTAX) => {
                let detail = user_err.first().cloned().unwrap_or_default();
                let mut parts = detail.splitn(3, ':');
                let _tag = parts.next();
                let line = parts.next().and_then(|n| n.parse::<u32>().ok()).filter(|n| *n > 0);
                let message = parts.next().unwrap_or("invalid syntax").to_string();
                Error::Compilation { message, line }
            }
            Some(STATUS_MEMORY) => Error::Memory(
                user_err
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "memory exhausted".to_string()),
            ),
            Some(STATUS_RUNTIME) => Error::Runtime(
                user_err
                    .iter()
                    .rev()
                    .find(|line| !line.trim().is_empty())
                    .cloned()
                    .unwrap_or_else(|| "uncaught exception".to_string()),
            ),
            // The wrapper never ran to completion: classify whatever the
            // interpreter itself printed.
            Some(_) => {
                if raw_stderr.contains("MemoryError") {
                    Error::Memory(last_line(raw_stderr))
                } else if raw_stderr.contains("SyntaxError") {
                    let line = self
                        .line_pattern
                        .captures(raw_stderr)
                        .and_then(|c| c.get(1))
                        .and_then(|m| m.as_str().parse().ok());
                    Error::Compilation {
                        message: last_line(raw_stderr),
                        line,
                    }
                } else {
                    Error::Runtime(last_line(raw_stderr))
                }
            }
            None => Error::Timeout(timeout.as_millis() as u64),
        }
    }
}

impl Default for PythonSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageSandbox for PythonSandbox {
    fn language(&self) -> Language {
        Language::Python
    }

    async fn run(
        &self,
        code: &str,
        stdin: Option<&str>,
        timeout: Duration,
        _memory_limit_mb: u64,
    ) -> ExecutionOutcome {
        let session = Uuid::new_v4();
        let started = Instant::now();

        let interpreter = match self.resolve_interpreter().await {
            Ok(path) => path.clone(),
            Err(error) => return ExecutionOutcome::from_error(Language::Python, &error),
        };

        let token = format!("SBX-{}", session.simple());
        let wrapper = render_wrapper(code, &token);

        let mut artifact = match tempfile::Builder::new()
            .prefix("sandbox-")
            .suffix(".py")
            .tempfile()
        {
            Ok(file) => file,
            Err(fault) => {
                let error = Error::Internal(format!("failed to create wrapper artifact: {}", fault));
                return ExecutionOutcome::from_error(Language::Python, &error);
            }
        };
        if let Err(fault) = artifact.write_all(wrapper.as_bytes()) {
            let error = Error::Internal(format!("failed to write wrapper artifact: {}", fault));
            return ExecutionOutcome::from_error(Language::Python, &error);
        }
        debug!(%session, artifact = %artifact.path().display(), "spawning interpreter");

        // -I: isolated mode, no site imports, env ignored. -X utf8: stdio
        // stays UTF-8 even with the cleared environment.
        let mut child = match Command::new(&interpreter)
            .arg("-I")
            .args(["-X", "utf8"])
            .arg(artifact.path())
            .env_clear()
            .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(fault) => {
                let error = Error::Internal(format!("failed to spawn interpreter: {}", fault));
                return ExecutionOutcome::from_error(Language::Python, &error);
            }
        };

        // Forward request stdin, then close the pipe to signal EOF.
        if let Some(mut pipe) = child.stdin.take() {
            if let Some(text) = stdin {
                let _ = pipe.write_all(text.as_bytes()).await;
            }
            drop(pipe);
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let waited = ResourceGuard::with_deadline(
            async {
                let mut out = Vec::new();
                let mut err = Vec::new();
                if let (Some(stdout_pipe), Some(stderr_pipe)) =
                    (stdout_pipe.as_mut(), stderr_pipe.as_mut())
                {
                    let _ = tokio::join!(
                        stdout_pipe.read_to_end(&mut out),
                        stderr_pipe.read_to_end(&mut err)
                    );
                }
                let status = child.wait().await;
                (status, out, err)
            },
            timeout,
        )
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        // The wrapper artifact rides on `artifact`'s drop on every path
        // below, including the kill branch.
        match waited {
            Err(timeout_error) => {
                let _ = child.kill().await;
                debug!(%session, "interpreter killed at deadline");
                ExecutionOutcome::failure(
                    Language::Python,
                    &timeout_error,
                    String::new(),
                    String::new(),
                    elapsed_ms,
                    child_peak_rss_bytes().unwrap_or(0),
                )
            }
            Ok((status, out, err)) => {
                let status = match status {
                    Ok(status) => status,
                    Err(fault) => {
                        let error = Error::Internal(format!("failed to reap interpreter: {}", fault));
                        return ExecutionOutcome::from_error(Language::Python, &error);
                    }
                };
                let raw_stdout = String::from_utf8_lossy(&out);
                let raw_stderr = String::from_utf8_lossy(&err);
                let streams = split_sentinel_streams(&raw_stdout, &token);
                let estimated_memory_bytes = child_peak_rss_bytes()
                    .unwrap_or_else(|| estimate_memory_cost(out.len() + err.len()));

                if status.success() {
                    debug!(%session, elapsed_ms, "interpreter run completed");
                    return ExecutionOutcome::success(
                        Language::Python,
                        streams.stdout,
                        streams.stderr,
                        streams.return_value,
                        elapsed_ms,
                        estimated_memory_bytes,
                    );
                }

                let err_lines: Vec<String> =
                    streams.stderr.lines().map(str::to_string).collect();
                let error = self.classify_exit(status.code(), &err_lines, &raw_stderr, timeout);
                let mut outcome = ExecutionOutcome::failure(
                    Language::Python,
                    &error,
                    streams.stdout,
                    streams.stderr,
                    elapsed_ms,
                    estimated_memory_bytes,
                );
                if let (Some(failure), Error::Runtime(_)) = (outcome.failure.as_mut(), &error) {
                    failure.stack = err_lines;
                }
                outcome
            }
        }
    }
}

fn render_wrapper(code: &str, token: &str) -> String {
    let encoded_code =
        serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    WRAPPER_TEMPLATE
        .replace("@@TOKEN@@", token)
        .replace("@@CODE@@", &encoded_code)
        .replace("@@STATUS_SECURITY@@", &STATUS_SECURITY.to_string())
        .replace("@@STATUS_SYNTAX@@", &STATUS_SYNTAX.to_string())
        .replace("@@STATUS_RUNTIME@@", &STATUS_RUNTIME.to_string())
        .replace("@@STATUS_MEMORY@@", &STATUS_MEMORY.to_string())
}

fn split_sentinel_streams(raw_stdout: &str, token: &str) -> SentinelStreams {
    let out_prefix = format!("{}|OUT|", token);
    let err_prefix = format!("{}|ERR|", token);
    let ret_prefix = format!("{}|RET|", token);

    let mut stdout_lines = Vec::new();
    let mut stderr_lines = Vec::new();
    let mut return_value = None;

    for line in raw_stdout.lines() {
        if let Some(rest) = line.strip_prefix(&out_prefix) {
            stdout_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix(&err_prefix) {
            stderr_lines.push(rest);
        } else if let Some(rest) = line.strip_prefix(&ret_prefix) {
            return_value = serde_json::from_str(rest).ok();
        }
    }

    SentinelStreams {
        stdout: stdout_lines.join("\n"),
        stderr: stderr_lines.join("\n"),
        return_value,
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("interpreter failed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapper_embeds_code_as_literal() {
        let wrapper = render_wrapper("print(\"hi\")\n# done", "SBX-t");
        assert!(wrapper.contains(r#"_CODE = "print(\"hi\")\n# done""#));
        assert!(wrapper.contains("_TOKEN = \"SBX-t\""));
        assert!(!wrapper.contains("@@"));
    }

    #[test]
    fn test_sentinel_split() {
        let raw = "SBX-t|OUT|hello\nnoise from the interpreter\nSBX-t|OUT|world\nSBX-t|ERR|oops\nSBX-t|RET|42\n";
        let streams = split_sentinel_streams(raw, "SBX-t");
        assert_eq!(streams.stdout, "hello\nworld");
        assert_eq!(streams.stderr, "oops");
        assert_eq!(streams.return_value, Some(serde_json::json!(42)));
    }

    #[test]
    fn test_spoofed_sentinel_requires_exact_token() {
        let raw = "SBX-other|OUT|forged\n";
        let streams = split_sentinel_streams(raw, "SBX-t");
        assert!(streams.stdout.is_empty());
    }

    #[test]
    fn test_classify_security_exit() {
        let sandbox = PythonSandbox::new();
        let error = sandbox.classify_exit(
            Some(STATUS_SECURITY),
            &["blocked: module 'os' is denied".to_string()],
            "",
            Duration::from_secs(1),
        );
        assert!(matches!(error, Error::Security(ref m) if m.contains("os")));
    }

    #[test]
    fn test_classify_syntax_exit() {
        let sandbox = PythonSandbox::new();
        let error = sandbox.classify_exit(
            Some(STATUS_SYNTAX),
            &["syntax:3:invalid syntax".to_string()],
            "",
            Duration::from_secs(1),
        );
        match error {
            Error::Compilation { message, line } => {
                assert_eq!(line, Some(3));
                assert_eq!(message, "invalid syntax");
            }
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_classify_signal_exit_as_timeout() {
        let sandbox = PythonSandbox::new();
        let error = sandbox.classify_exit(None, &[], "", Duration::from_millis(500));
        assert!(matches!(error, Error::Timeout(500)));
    }
}
