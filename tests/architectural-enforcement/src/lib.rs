//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the switchyard crates:
//! - No sleep() calls in production code outside retry backoff
//! - No blocking I/O inside async functions
//!
//! The helpers here load production sources (everything before a file's
//! `#[cfg(test)]` module) and answer simple questions about where a line sits.

use std::fs;
use std::path::{Path, PathBuf};

/// Crate source directories checked by the enforcement tests, relative to the
/// workspace root
pub const PRODUCTION_DIRS: &[&str] = &["switchyard/core/src", "switchyard/daemon/src"];

/// Workspace root, resolved from this crate's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Production part of one source file
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Keep lines up to the first `#[cfg(test)]`
    pub fn from_content(path: impl Into<PathBuf>, content: &str) -> Self {
        let lines = content
            .lines()
            .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(str::to_string)
            .collect();
        Self {
            path: path.into(),
            lines,
        }
    }

    /// Code part of a line, comments stripped
    pub fn code(&self, idx: usize) -> &str {
        let line = &self.lines[idx];
        let trimmed = line.trim_start();
        if trimmed.starts_with("//") {
            return "";
        }
        line.split(" //").next().unwrap_or(line)
    }

    /// Signature line of the function enclosing `idx`, if any
    pub fn enclosing_fn(&self, idx: usize) -> Option<&str> {
        (0..=idx)
            .rev()
            .map(|i| self.lines[i].trim())
            .find(|line| is_fn_signature(line))
    }

    /// Whether `idx` sits inside an `async fn`
    ///
    /// Lines inside `async move` blocks of a plain function count as async too.
    pub fn in_async_context(&self, idx: usize) -> bool {
        for i in (0..=idx).rev() {
            let line = self.lines[i].trim();
            if line.contains("async move") || line.contains("async {") {
                return true;
            }
            if is_fn_signature(line) {
                return line.contains("async fn");
            }
        }
        false
    }

    /// Whether any line within `before` lines above or `after` below mentions `needle`
    pub fn nearby(&self, idx: usize, before: usize, after: usize, needle: &str) -> bool {
        let start = idx.saturating_sub(before);
        let end = (idx + after + 1).min(self.lines.len());
        self.lines[start..end]
            .iter()
            .any(|line| line.to_lowercase().contains(needle))
    }

    /// `path:line - text` for violation reports
    pub fn describe(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {what}: {}",
            self.path.display(),
            idx + 1,
            self.lines[idx].trim()
        )
    }
}

fn is_fn_signature(line: &str) -> bool {
    line.starts_with("fn ")
        || line.starts_with("pub fn ")
        || line.starts_with("async fn ")
        || line.starts_with("pub async fn ")
        || line.starts_with("pub(crate) fn ")
        || line.starts_with("pub(crate) async fn ")
}

/// Every production `.rs` file under [`PRODUCTION_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();
    for dir in PRODUCTION_DIRS {
        let dir = root.join(dir);
        for entry in walkdir::WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            if let Ok(content) = fs::read_to_string(entry.path()) {
                files.push(SourceFile::from_content(entry.path(), &content));
            }
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
fn load() {
    std::fs::read_to_string(\"x\");
}

pub async fn run() {
    // tokio::time::sleep in a comment
    let handle = tokio::spawn(async move {
        work().await;
    });
}

#[cfg(test)]
mod tests {
    fn helper() {}
}
";

    #[test]
    fn test_test_module_is_excluded() {
        let file = SourceFile::from_content("sample.rs", SAMPLE);
        assert!(file.lines.iter().all(|l| !l.contains("helper")));
    }

    #[test]
    fn test_enclosing_fn_and_async_context() {
        let file = SourceFile::from_content("sample.rs", SAMPLE);
        assert_eq!(file.enclosing_fn(1), Some("fn load() {"));
        assert!(!file.in_async_context(1));
        assert!(file.in_async_context(7));
    }

    #[test]
    fn test_comments_are_not_code() {
        let file = SourceFile::from_content("sample.rs", SAMPLE);
        assert_eq!(file.code(5), "");
    }

    #[test]
    fn test_sources_are_found() {
        let files = production_sources();
        assert!(files
            .iter()
            .any(|f| f.path.ends_with("switchyard/core/src/lib.rs")));
    }
}
