//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: async code in the switchyard crates MUST NOT use blocking I/O.
//! **Required**: `tokio::fs`, `tokio::io`, async `reqwest`.
//! **Acceptable**: plain functions that run before the runtime does work
//! (config loading), test code.

use architectural_enforcement::{production_sources, SourceFile};

const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    ("std::thread::sleep", "Blocking sleep"),
];

/// Test that async production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let violations: Vec<String> = production_sources()
        .iter()
        .flat_map(blocking_violations)
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O found in async code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs, tokio::io or async reqwest instead.");

        panic!(
            "\nFound {} blocking I/O violation(s) in async code.",
            violations.len()
        );
    }
}

fn blocking_violations(file: &SourceFile) -> Vec<String> {
    let mut violations = Vec::new();
    for idx in 0..file.lines.len() {
        let code = file.code(idx);
        for (pattern, what) in BLOCKING_PATTERNS {
            if code.contains(pattern) && file.in_async_context(idx) {
                violations.push(file.describe(idx, what));
            }
        }
    }
    violations
}

#[test]
fn test_detector_flags_std_fs_in_async_fn() {
    let file = SourceFile::from_content(
        "bad.rs",
        "pub async fn save() {\n    std::fs::write(path, bytes)?;\n}\n",
    );
    assert_eq!(blocking_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_std_fs_in_plain_fn() {
    let file = SourceFile::from_content(
        "ok.rs",
        "pub fn load() {\n    let text = std::fs::read_to_string(path)?;\n}\n",
    );
    assert!(blocking_violations(&file).is_empty());
}
