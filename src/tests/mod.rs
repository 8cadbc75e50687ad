mod utils;

use serde_json::{json, Map};
use std::sync::Arc;

use crate::error::FailureKind;
use crate::tests::utils::dispatcher;
use crate::types::{ExecutionRequest, Language};

#[tokio::test]
async fn test_empty_code_is_a_validation_error() {
    let service = dispatcher();
    for code in ["", "   ", "\n\t\n"] {
        let outcome = service
            .dispatch(ExecutionRequest::new(Language::JavaScript, code))
            .await;
        assert!(!outcome.succeeded);
        let failure = outcome.failure.expect("expected a failure");
        assert_eq!(failure.kind, FailureKind::ValidationError);
        assert!(failure.message.contains("empty"));
    }
}

#[tokio::test]
async fn test_oversized_code_is_a_validation_error() {
    let service = dispatcher();
    let request = ExecutionRequest::new(Language::Python, "x = 1\n".repeat(20_000));
    let outcome = service.dispatch(request).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::ValidationError));
}

#[tokio::test]
async fn test_out_of_range_timeout_is_a_validation_error() {
    let service = dispatcher();
    let request = ExecutionRequest::new(Language::Python, "print(1)").with_timeout_ms(50);
    let outcome = service.dispatch(request).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::ValidationError));
}

#[tokio::test]
async fn test_blocked_code_never_reaches_a_sandbox() {
    let service = dispatcher();
    let request = ExecutionRequest::new(
        Language::JavaScript,
        "const fs = require('fs'); console.log('never')",
    );
    let outcome = service.dispatch(request).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::SecurityError));
    assert!(outcome.stdout.is_empty());
    // Rejection happens before any context is built.
    assert_eq!(outcome.elapsed_ms, 0);

    let request = ExecutionRequest::new(Language::Python, "import os\nprint(os.getcwd())");
    let outcome = service.dispatch(request).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::SecurityError));
    let failure = outcome.failure.expect("expected a failure");
    assert!(failure.message.contains("os"));
}

#[tokio::test]
async fn test_all_violations_reported_in_detail() {
    let service = dispatcher();
    let request = ExecutionRequest::new(Language::Python, "import os\neval('1')\nopen('f')");
    let outcome = service.dispatch(request).await;
    let failure = outcome.failure.expect("expected a failure");
    let detail = failure.detail.expect("expected violation detail");
    assert!(detail.contains("py-host-module"));
    assert!(detail.contains("py-dynamic-eval"));
    assert!(detail.contains("py-file-open"));
}

#[test]
fn test_validate_only_is_idempotent_and_runs_no_sandbox() {
    let service = dispatcher();
    let code = "import os\nrange(10**9)";
    let first = service.validate_only(Language::Python, code);
    let second = service.validate_only(Language::Python, code);
    assert_eq!(first, second);
    assert!(!first.accepted);
    assert!(!first.advisories.is_empty());
}

#[test]
fn test_capabilities_are_static() {
    let service = dispatcher();
    let caps = service.describe_capabilities();
    assert_eq!(caps.languages.len(), 2);
    assert_eq!(caps.limits.max_code_chars, 50_000);
    assert_eq!(caps.limits.max_timeout_ms, 60_000);

    let languages: Vec<Language> = caps.languages.iter().map(|l| l.language).collect();
    assert!(languages.contains(&Language::JavaScript));
    assert!(languages.contains(&Language::Python));
}

#[tokio::test]
async fn test_binding_with_keyword_name_is_rejected() {
    let service = dispatcher();
    let mut bindings = Map::new();
    bindings.insert("class".to_string(), json!(1));
    let outcome = service
        .dispatch_with_bindings(
            ExecutionRequest::new(Language::JavaScript, "console.log(1)"),
            &bindings,
        )
        .await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::ValidationError));
}

#[tokio::test]
async fn test_injected_bindings_are_validated_like_code() {
    let service = dispatcher();
    let mut bindings = Map::new();
    bindings.insert("payload".to_string(), json!("x"));
    // The hand-written part is clean; the combined source still passes
    // through the same rule tables.
    let outcome = service
        .dispatch_with_bindings(
            ExecutionRequest::new(Language::JavaScript, "eval(payload)"),
            &bindings,
        )
        .await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::SecurityError));
}

#[tokio::test]
async fn test_bindings_reach_javascript_code() {
    let service = dispatcher();
    let mut bindings = Map::new();
    bindings.insert("greeting".to_string(), json!("hello"));
    bindings.insert("count".to_string(), json!(2));
    let outcome = service
        .dispatch_with_bindings(
            ExecutionRequest::new(Language::JavaScript, "console.log(greeting.repeat(count))"),
            &bindings,
        )
        .await;
    assert!(outcome.succeeded, "failure: {:?}", outcome.failure);
    assert_eq!(outcome.stdout, "hellohello");
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let service = Arc::new(dispatcher());

    let mut handles = vec![];
    for i in 0..3 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let request = ExecutionRequest::new(
                Language::JavaScript,
                format!("console.log('run {}')", i),
            );
            service.dispatch(request).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let outcome = handle.await.unwrap();
        assert!(outcome.succeeded, "failure: {:?}", outcome.failure);
        assert_eq!(outcome.stdout, format!("run {}", i));
    }
}

#[tokio::test]
async fn test_execution_slots_match_configuration() {
    let service = crate::ExecutionDispatcher::new(crate::ExecutionConfig {
        max_concurrent: 2,
        ..Default::default()
    });
    assert_eq!(service.available_slots(), 2);

    let outcome = service
        .dispatch(ExecutionRequest::new(Language::JavaScript, "console.log('ok')"))
        .await;
    assert!(outcome.succeeded);
    // Permit released once the run finishes.
    assert_eq!(service.available_slots(), 2);
}

#[tokio::test]
async fn test_failed_run_does_not_poison_the_next() {
    let service = dispatcher();

    let bad = ExecutionRequest::new(Language::JavaScript, "throw new Error('boom')");
    let outcome = service.dispatch(bad).await;
    assert_eq!(outcome.failure_kind(), Some(FailureKind::RuntimeError));

    let good = ExecutionRequest::new(Language::JavaScript, "console.log('still fine')");
    let outcome = service.dispatch(good).await;
    assert!(outcome.succeeded);
    assert_eq!(outcome.stdout, "still fine");
}
