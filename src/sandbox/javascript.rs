//! In-process interpreted context for JavaScript snippets.
//!
//! Every run gets a freshly constructed V8 isolate whose globals carry only
//! side-effect-free primitives plus three injected capabilities: a
//! capturing console/print surface, a line-replaying `readLine`, and a
//! severely constrained timer. The host bridge (`Deno`) is removed before
//! user code runs. Two bounds race each other: a watchdog that terminates
//! the isolate at the deadline, and an independent task deadline as a
//! backstop for the cases where isolate termination does not take.

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::guard::{estimate_memory_cost, ResourceGuard};
use crate::sandbox::{stdin_lines, LanguageSandbox};
use crate::types::{ExecutionOutcome, Language};

/// Extra budget granted to the independent deadline so the in-isolate
/// watchdog normally wins the race.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

const MEMORY_SIGNATURES: &[&str] = &["out of memory", "allocation failed", "heap limit"];

const PRELUDE: &str = r#"
delete globalThis.Deno;
(() => {
  const lines = globalThis.__stdin_lines;
  delete globalThis.__stdin_lines;
  let cursor = 0;
  const out = [];
  const err = [];
  const render = (args) => args.map((item) => {
    if (typeof item === "string") return item;
    try {
      const encoded = JSON.stringify(item);
      return encoded === undefined ? String(item) : encoded;
    } catch (_) {
      return String(item);
    }
  }).join(" ");
  globalThis.console = {
    log: (...args) => { out.push(render(args)); },
    info: (...args) => { out.push(render(args)); },
    debug: (...args) => { out.push(render(args)); },
    warn: (...args) => { err.push(render(args)); },
    error: (...args) => { err.push(render(args)); },
  };
  globalThis.print = (...args) => { out.push(render(args)); };
  globalThis.readLine = () => (cursor < lines.length ? lines[cursor++] : "");
  globalThis.prompt = (message) => {
    if (message !== undefined) out.push(String(message));
    return globalThis.readLine();
  };
  globalThis.setTimeout = (callback, delay) => {
    if (typeof callback !== "function") {
      throw new TypeError("setTimeout requires a callback function");
    }
    if ((delay || 0) >= 5000) {
      throw new RangeError("setTimeout delay must stay below 5000ms");
    }
    callback();
    return 0;
  };
  globalThis.setInterval = () => {
    throw new Error("setInterval is not available in this context");
  };
  globalThis.clearTimeout = () => {};
  globalThis.clearInterval = () => {};
  globalThis.__capture = (fault) => {
    err.push(String(fault && fault.stack ? fault.stack : fault));
  };
  globalThis.__drain = () => {
    const encode = (value, depth, seen) => {
      if (value === null) return null;
      const kind = typeof value;
      if (kind === "undefined") return undefined;
      if (kind === "number" || kind === "boolean" || kind === "string") return value;
      if (kind === "bigint" || kind === "symbol" || kind === "function") {
        return { __type__: kind };
      }
      if (depth >= 16) return "[max depth exceeded]";
      if (seen.has(value)) return "[circular]";
      seen.add(value);
      if (Array.isArray(value)) {
        return value.map((item) => {
          const encoded = encode(item, depth + 1, seen);
          return encoded === undefined ? null : encoded;
        });
      }
      const result = {};
      for (const key of Object.keys(value)) {
        const encoded = encode(value[key], depth + 1, seen);
        if (encoded !== undefined) result[key] = encoded;
      }
      return result;
    };
    const payload = { stdout: out.join("\n"), stderr: err.join("\n") };
    const value = encode(globalThis.__completion, 0, new Set());
    if (value !== undefined) payload.value = value;
    return JSON.stringify(payload);
  };
})();
"#;

#[derive(Default)]
struct RawRun {
    stdout: String,
    stderr: String,
    return_value: Option<Value>,
    fault: Option<String>,
}

#[derive(Deserialize, Default)]
struct DrainPayload {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    value: Option<Value>,
}

pub struct JavaScriptSandbox {
    line_pattern: Regex,
}

impl JavaScriptSandbox {
    pub fn new() -> Self {
        Self {
            line_pattern: Regex::new(r"<code>:(\d+)").unwrap(),
        }
    }

    fn classify(&self, fault: &str, timeout: Duration) -> Error {
        let lowered = fault.to_lowercase();
        if lowered.contains("execution terminated") {
            return Error::Timeout(timeout.as_millis() as u64);
        }
        if MEMORY_SIGNATURES.iter().any(|sig| lowered.contains(sig)) {
            return Error::Memory(first_line(fault));
        }
        if fault.contains("SyntaxError") {
            return Error::Compilation {
                message: first_line(fault),
                line: self.extract_line(fault),
            };
        }
        Error::Runtime(first_line(fault))
    }

    // User line N sits at wrapper line N+1; undo the offset.
    fn extract_line(&self, fault: &str) -> Option<u32> {
        let raw: u32 = self.line_pattern.captures(fault)?.get(1)?.as_str().parse().ok()?;
        Some(raw.saturating_sub(1).max(1))
    }
}

impl Default for JavaScriptSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageSandbox for JavaScriptSandbox {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    async fn run(
        &self,
        code: &str,
        stdin: Option<&str>,
        timeout: Duration,
        memory_limit_mb: u64,
    ) -> ExecutionOutcome {
        let session = Uuid::new_v4();
        let started = Instant::now();
        debug!(%session, timeout_ms = timeout.as_millis() as u64, "starting isolate run");

        let lines = stdin_lines(stdin);
        let stdin_json = serde_json::to_string(&lines).unwrap_or_else(|_| "[]".to_string());
        let source = code.to_string();

        let handle_slot: Arc<Mutex<Option<v8::IsolateHandle>>> = Arc::new(Mutex::new(None));

        let task_slot = handle_slot.clone();
        let task = tokio::task::spawn_blocking(move || {
            execute_in_isolate(source, stdin_json, memory_limit_mb, task_slot)
        });

        let watchdog_slot = handle_slot.clone();
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Ok(slot) = watchdog_slot.lock() {
                if let Some(handle) = slot.as_ref() {
                    handle.terminate_execution();
                }
            }
        });

        let raced = ResourceGuard::with_deadline(task, timeout + DEADLINE_GRACE).await;
        watchdog.abort();

        let raw = match raced {
            Ok(Ok(raw)) => raw,
            Ok(Err(join_fault)) => {
                let error = Error::Internal(format!("isolate task failed: {}", join_fault));
                return ExecutionOutcome::failure(
                    Language::JavaScript,
                    &error,
                    String::new(),
                    String::new(),
                    started.elapsed().as_millis() as u64,
                    0,
                );
            }
            Err(_) => {
                // Independent deadline won; make sure the isolate unwinds too.
                if let Ok(slot) = handle_slot.lock() {
                    if let Some(handle) = slot.as_ref() {
                        handle.terminate_execution();
                    }
                }
                debug!(%session, "isolate run hit the independent deadline");
                let error = Error::Timeout(timeout.as_millis() as u64);
                return ExecutionOutcome::failure(
                    Language::JavaScript,
                    &error,
                    String::new(),
                    String::new(),
                    started.elapsed().as_millis() as u64,
                    0,
                );
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let serialized = raw.stdout.len()
            + raw.stderr.len()
            + raw
                .return_value
                .as_ref()
                .and_then(|v| serde_json::to_string(v).ok())
                .map(|s| s.len())
                .unwrap_or(0);
        let estimated_memory_bytes = estimate_memory_cost(serialized);

        match raw.fault {
            None => {
                debug!(%session, elapsed_ms, "isolate run completed");
                ExecutionOutcome::success(
                    Language::JavaScript,
                    raw.stdout,
                    raw.stderr,
                    raw.return_value,
                    elapsed_ms,
                    estimated_memory_bytes,
                )
            }
            Some(fault) => {
                let error = self.classify(&fault, timeout);
                let frames: Vec<String> = fault
                    .lines()
                    .skip(1)
                    .map(|line| line.trim().to_string())
                    .filter(|line| !line.is_empty())
                    .collect();
                let mut outcome = ExecutionOutcome::failure(
                    Language::JavaScript,
                    &error,
                    raw.stdout,
                    raw.stderr,
                    elapsed_ms,
                    estimated_memory_bytes,
                );
                if let Some(failure) = outcome.failure.as_mut() {
                    failure.stack = frames;
                }
                outcome
            }
        }
    }
}

fn execute_in_isolate(
    code: String,
    stdin_json: String,
    memory_limit_mb: u64,
    handle_slot: Arc<Mutex<Option<v8::IsolateHandle>>>,
) -> RawRun {
    let mut options = RuntimeOptions::default();
    if memory_limit_mb > 0 {
        let max_bytes = (memory_limit_mb as usize) * 1024 * 1024;
        let initial_bytes = (max_bytes / 10).min(10 * 1024 * 1024);
        options.create_params =
            Some(v8::CreateParams::default().heap_limits(initial_bytes, max_bytes));
    }

    let mut runtime = JsRuntime::new(options);
    if let Ok(mut slot) = handle_slot.lock() {
        slot.replace(runtime.v8_isolate().thread_safe_handle());
    }

    let mut raw = RawRun::default();

    let prelude = format!("globalThis.__stdin_lines = {};\n{}", stdin_json, PRELUDE);
    if let Err(fault) = runtime.execute_script("<sandbox-prelude>", prelude) {
        raw.fault = Some(format!("context setup failed: {}", fault));
        return raw;
    }

    // User line N lands on wrapper line N+1.
    let wrapped = format!(
        "try {{\n{}\n}} catch (fault) {{ globalThis.__capture(fault); throw fault; }}",
        code
    );
    let completion = runtime.execute_script("<code>", wrapped);
    match completion {
        Ok(global) => {
            let scope = &mut runtime.handle_scope();
            let local = v8::Local::new(scope, global);
            let context = scope.get_current_context();
            let global_object = context.global(scope);
            if let Some(key) = v8::String::new(scope, "__completion") {
                global_object.set(scope, key.into(), local);
            }
        }
        Err(fault) => raw.fault = Some(fault.to_string()),
    }

    // A terminated isolate refuses further scripts until the termination
    // request is cleared.
    runtime.v8_isolate().cancel_terminate_execution();
    if let Ok(global) = runtime.execute_script("<sandbox-drain>", "globalThis.__drain()") {
        let scope = &mut runtime.handle_scope();
        let local = v8::Local::new(scope, global);
        if let Ok(encoded) = deno_core::serde_v8::from_v8::<String>(scope, local) {
            if let Ok(payload) = serde_json::from_str::<DrainPayload>(&encoded) {
                raw.stdout = payload.stdout;
                raw.stderr = payload.stderr;
                raw.return_value = payload.value;
            }
        }
    }

    raw
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or_default().to_string()
}
