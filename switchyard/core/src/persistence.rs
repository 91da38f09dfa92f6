//! Persisted router state
//!
//! Performance records and the context graph are written as one JSON
//! document. Writes go to a sibling temp file that is renamed into place, so
//! a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::graph::GraphSnapshot;
use crate::registry::PerformanceRecord;

/// Format version written by this build
pub const STATE_VERSION: u32 = 1;

/// Errors reading or writing persisted state
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("state file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unsupported state version {0} (expected {STATE_VERSION})")]
    UnsupportedVersion(u32),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> PersistenceError + '_ {
    move |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything the router carries across restarts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<PerformanceRecord>,
    pub graph: GraphSnapshot,
}

impl StateSnapshot {
    #[must_use]
    pub fn new(records: Vec<PerformanceRecord>, graph: GraphSnapshot) -> Self {
        Self {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            records,
            graph,
        }
    }
}

/// Default state location: `~/.local/share/switchyard/state.json` on Linux
#[must_use]
pub fn default_state_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("switchyard").join("state.json"))
}

/// Write `snapshot` to `path`, replacing any previous file
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file written.
pub async fn save(path: &Path, snapshot: &StateSnapshot) -> Result<(), PersistenceError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let body = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &body).await.map_err(io_error(&tmp))?;
    tokio::fs::rename(&tmp, path).await.map_err(io_error(path))?;

    info!(
        path = %path.display(),
        records = snapshot.records.len(),
        nodes = snapshot.graph.nodes.len(),
        bytes = body.len(),
        "Saved router state"
    );
    Ok(())
}

/// Read a snapshot; a missing file yields `None`
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read, decoded, or has
/// an unknown version.
pub async fn load(path: &Path) -> Result<Option<StateSnapshot>, PersistenceError> {
    let body = match tokio::fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No saved state");
            return Ok(None);
        }
        Err(e) => return Err(io_error(path)(e)),
    };

    let snapshot: StateSnapshot = serde_json::from_slice(&body)?;
    if snapshot.version != STATE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(snapshot.version));
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ContextGraph, NewNode};
    use crate::registry::LatencyClass;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample() -> StateSnapshot {
        let graph = ContextGraph::default();
        let first = graph.insert(NewNode::new("rust borrow checker error")).id;
        graph.insert(NewNode::new("borrow checker lifetimes").follows(first));
        StateSnapshot::new(
            vec![PerformanceRecord::seeded("alpha", LatencyClass::Fast)],
            graph.export(),
        )
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let snapshot = sample();

        save(&path, &snapshot).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();

        assert_eq!(loaded.version, STATE_VERSION);
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].model_id, "alpha");
        assert_eq!(loaded.graph, snapshot.graph);
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load(&dir.path().join("absent.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let mut snapshot = sample();
        snapshot.version = 99;
        save(&path, &snapshot).await.unwrap();

        assert!(matches!(
            load(&path).await,
            Err(PersistenceError::UnsupportedVersion(99))
        ));
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(load(&path).await, Err(PersistenceError::Encode(_))));
    }
}
