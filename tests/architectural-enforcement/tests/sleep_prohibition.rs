//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the switchyard crates MUST NOT call sleep.
//! **Exceptions**: retry backoff between fallback attempts, test code.
//! Periodic work uses `tokio::time::interval`, waiting uses channels or
//! cancellation tokens.

use architectural_enforcement::{production_sources, SourceFile};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(sleep_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nAcceptable: backoff between retries, test code.");
        eprintln!("Use tokio::time::interval for periodic tasks.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn sleep_violations(file: &SourceFile) -> Vec<String> {
    (0..file.lines.len())
        .filter(|&idx| {
            let code = file.code(idx);
            code.contains("::sleep(") || code.contains(".sleep(")
        })
        .filter(|&idx| !is_backoff_context(file, idx))
        .map(|idx| file.describe(idx, "sleep"))
        .collect()
}

/// Sleep is a retry backoff when the delay itself is a backoff
fn is_backoff_context(file: &SourceFile, idx: usize) -> bool {
    file.code(idx).contains("sleep(backoff") || file.nearby(idx, 15, 0, "backoff_for_attempt")
}

#[test]
fn test_detector_flags_plain_sleep() {
    let file = SourceFile::from_content(
        "bad.rs",
        "async fn poll() {\n    loop {\n        tokio::time::sleep(Duration::from_millis(10)).await;\n    }\n}\n",
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_backoff() {
    let file = SourceFile::from_content(
        "ok.rs",
        "async fn retry() {\n    let backoff = config.backoff_for_attempt(n);\n    tokio::time::sleep(backoff).await;\n}\n",
    );
    assert!(sleep_violations(&file).is_empty());
}
