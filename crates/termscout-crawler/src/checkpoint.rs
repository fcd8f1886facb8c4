use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::write_atomically;
use crate::target::{ResultSummary, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::InProgress => f.write_str("in-progress"),
            Self::Done => f.write_str("done"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    pub status: Status,
    /// Present once the target is done
    #[serde(default)]
    pub summary: Option<ResultSummary>,
    pub updated_at: DateTime<Utc>,
}

pub type CheckpointState = BTreeMap<TargetId, CheckpointEntry>;

/// Durable per-target completion record, the only input to resume decisions.
pub trait CheckpointStore: Send + Sync {
    /// State recorded by previous runs, empty when there is none.
    fn load(&self) -> anyhow::Result<CheckpointState>;

    /// Records a status transition. Either the whole write is durable or
    /// the store is left as it was.
    fn mark(&self, id: &TargetId, status: Status, summary: Option<ResultSummary>) -> anyhow::Result<()>;

    fn get(&self, id: &TargetId) -> Option<CheckpointEntry>;

    fn is_done(&self, id: &TargetId) -> bool {
        self.get(id).map_or(false, |e| e.status == Status::Done)
    }
}

/// Checkpoint living only as long as the process, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    state: RwLock<CheckpointState>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> anyhow::Result<CheckpointState> {
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn mark(&self, id: &TargetId, status: Status, summary: Option<ResultSummary>) -> anyhow::Result<()> {
        let entry = CheckpointEntry {
            status,
            summary,
            updated_at: Utc::now(),
        };
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);
        Ok(())
    }

    fn get(&self, id: &TargetId) -> Option<CheckpointEntry> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    #[serde(default)]
    targets: CheckpointState,
}

/// JSON checkpoint file, rewritten as a whole and atomically replaced on
/// every transition.
#[derive(Debug)]
pub struct FileCheckpoint {
    path: PathBuf,
    state: RwLock<CheckpointState>,
    writer: Mutex<()>,
}

impl FileCheckpoint {
    /// Opens the checkpoint at `path`. Targets a previous run left in
    /// progress are reset to pending.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let mut state = match fs_err::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<CheckpointFile>(&bytes)
                    .with_context(|| format!("Invalid checkpoint file {}", path.display()))?
                    .targets
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CheckpointState::new(),
            Err(e) => return Err(e.into()),
        };

        for (id, entry) in state.iter_mut() {
            if entry.status == Status::InProgress {
                log::warn!("Target {id} was interrupted by a previous run, it will be retried");
                entry.status = Status::Pending;
            }
        }

        log::info!("Loaded checkpoint {} with {} targets", path.display(), state.len());
        Ok(Self {
            path,
            state: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> anyhow::Result<CheckpointState> {
        Ok(self.state.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn mark(&self, id: &TargetId, status: Status, summary: Option<ResultSummary>) -> anyhow::Result<()> {
        let _writing = self.writer.lock().unwrap_or_else(|e| e.into_inner());

        let mut next = self.load()?;
        next.insert(
            id.clone(),
            CheckpointEntry {
                status,
                summary,
                updated_at: Utc::now(),
            },
        );

        let file = CheckpointFile { targets: next };
        let bytes = serde_json::to_vec_pretty(&file)?;
        write_atomically(&self.path, &bytes)
            .with_context(|| format!("Couldn't write checkpoint {}", self.path.display()))?;

        *self.state.write().unwrap_or_else(|e| e.into_inner()) = file.targets;
        log::debug!("Checkpoint: {id} -> {status}");
        Ok(())
    }

    fn get(&self, id: &TargetId) -> Option<CheckpointEntry> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::target::ScrapeStatus;

    fn id(s: &str) -> TargetId {
        TargetId(s.into())
    }

    fn summary() -> ResultSummary {
        ResultSummary {
            status: ScrapeStatus::Success,
            pages_scanned: 4,
            total_occurrences: 2,
            term_counts: [("race equity".to_string(), 2)].into_iter().collect(),
            matched_urls: BTreeSet::from(["https://oak.example.org/policy".to_string()]),
            summary: None,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn done_survives_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let done = summary();
        let store = FileCheckpoint::open(&path).unwrap();
        assert!(store.load().unwrap().is_empty());
        store.mark(&id("oak_NC"), Status::InProgress, None).unwrap();
        store.mark(&id("oak_NC"), Status::Done, Some(done.clone())).unwrap();
        store.mark(&id("elm_NC"), Status::Failed, None).unwrap();
        drop(store);

        let store = FileCheckpoint::open(&path).unwrap();
        assert!(store.is_done(&id("oak_NC")));
        assert!(!store.is_done(&id("elm_NC")));
        assert!(!store.is_done(&id("pine_NC")));
        assert_eq!(store.get(&id("oak_NC")).unwrap().summary, Some(done));
    }

    #[test]
    fn in_progress_is_treated_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let store = FileCheckpoint::open(&path).unwrap();
        store.mark(&id("oak_NC"), Status::InProgress, None).unwrap();
        drop(store);

        let store = FileCheckpoint::open(&path).unwrap();
        assert!(!store.is_done(&id("oak_NC")));
        assert_eq!(store.get(&id("oak_NC")).unwrap().status, Status::Pending);
    }

    #[test]
    fn leftover_temp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");

        let store = FileCheckpoint::open(&path).unwrap();
        store.mark(&id("oak_NC"), Status::Done, Some(summary())).unwrap();
        drop(store);

        // A write interrupted before the rename
        fs_err::write(dir.path().join(".tmpAbC123"), b"{\"targets\": {\"elm_NC\": {\"sta").unwrap();

        let store = FileCheckpoint::open(&path).unwrap();
        assert!(store.is_done(&id("oak_NC")));
        assert!(store.get(&id("elm_NC")).is_none());
    }

    #[test]
    fn file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("progress.json");

        let store = FileCheckpoint::open(&path).unwrap();
        store.mark(&id("oak_NC"), Status::Failed, None).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&fs_err::read(&path).unwrap()).unwrap();
        assert_eq!(json["targets"]["oak_NC"]["status"], "failed");
        assert!(json["targets"]["oak_NC"]["updatedAt"].is_string());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.json");
        fs_err::write(&path, b"not json").unwrap();
        assert!(FileCheckpoint::open(&path).is_err());
    }

    #[test]
    fn memory_store() {
        let store = MemoryCheckpoint::new();
        store.mark(&id("oak_NC"), Status::InProgress, None).unwrap();
        assert!(!store.is_done(&id("oak_NC")));
        store.mark(&id("oak_NC"), Status::Done, Some(summary())).unwrap();
        assert!(store.is_done(&id("oak_NC")));
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
