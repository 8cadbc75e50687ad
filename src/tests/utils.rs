use crate::dispatcher::ExecutionDispatcher;
use crate::types::ExecutionConfig;

pub(crate) fn dispatcher() -> ExecutionDispatcher {
    ExecutionDispatcher::new(ExecutionConfig::default())
}

/// Interpreter-dependent tests bail out quietly on hosts without one.
pub(crate) fn python_missing() -> bool {
    let found = ["python3", "python"]
        .iter()
        .any(|candidate| which::which(candidate).is_ok());
    if !found {
        eprintln!("Skipping test: no Python interpreter available");
    }
    !found
}
