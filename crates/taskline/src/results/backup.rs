//! Result queue backup stores
//!
//! A backup holds results the sink could not accept. Every operation is
//! keyed by task id: a second put of the same id replaces the first.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::QueuedTaskResult;

const BACKUP_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Backup errors
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fallback storage for results the sink rejected
#[async_trait]
pub trait ResultQueueBackup: Send + Sync + 'static {
    /// Prepare the backup for use
    async fn init(&self) -> Result<(), BackupError>;

    /// Store `result`, replacing any earlier entry for the same task
    async fn put(&self, result: &QueuedTaskResult) -> Result<(), BackupError>;

    /// Forget the entry for `id`; removing a missing entry succeeds
    async fn remove(&self, id: Uuid) -> Result<(), BackupError>;

    /// Every entry currently held, oldest task first
    async fn retrieve_backed_up_items(&self) -> Result<Vec<QueuedTaskResult>, BackupError>;
}

fn sort_oldest_first(items: &mut [QueuedTaskResult]) {
    items.sort_by(|a, b| a.posted_at.cmp(&b.posted_at).then(a.id.cmp(&b.id)));
}

// =============================================================================
// In-memory backup
// =============================================================================

/// Process-local backup
///
/// Survives sink outages but not restarts.
#[derive(Default)]
pub struct InMemoryResultQueueBackup {
    items: DashMap<Uuid, QueuedTaskResult>,
}

impl InMemoryResultQueueBackup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl ResultQueueBackup for InMemoryResultQueueBackup {
    async fn init(&self) -> Result<(), BackupError> {
        Ok(())
    }

    async fn put(&self, result: &QueuedTaskResult) -> Result<(), BackupError> {
        self.items.insert(result.id, result.clone());
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), BackupError> {
        self.items.remove(&id);
        Ok(())
    }

    async fn retrieve_backed_up_items(&self) -> Result<Vec<QueuedTaskResult>, BackupError> {
        let mut items: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        sort_oldest_first(&mut items);
        Ok(items)
    }
}

// =============================================================================
// File system backup
// =============================================================================

/// One JSON document per task id under a directory
///
/// Puts write a temporary file and rename it over the entry, so a crash
/// never leaves a half-written entry behind.
#[derive(Debug, Clone)]
pub struct FileResultQueueBackup {
    dir: PathBuf,
}

impl FileResultQueueBackup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.{BACKUP_EXTENSION}"))
    }
}

#[async_trait]
impl ResultQueueBackup for FileResultQueueBackup {
    async fn init(&self) -> Result<(), BackupError> {
        fs::create_dir_all(&self.dir).await?;

        // Leftovers of puts interrupted by a crash
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                debug!(path = %path.display(), "Removing stale backup temp file");
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }

    async fn put(&self, result: &QueuedTaskResult) -> Result<(), BackupError> {
        let path = self.entry_path(result.id);
        let temp = path.with_extension(TEMP_EXTENSION);
        let json = serde_json::to_vec_pretty(result)?;

        fs::write(&temp, json).await?;
        fs::rename(&temp, &path).await?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<(), BackupError> {
        match fs::remove_file(self.entry_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn retrieve_backed_up_items(&self) -> Result<Vec<QueuedTaskResult>, BackupError> {
        let mut items = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == BACKUP_EXTENSION) {
                continue;
            }

            let content = fs::read(&path).await?;
            match serde_json::from_slice::<QueuedTaskResult>(&content) {
                Ok(result) => items.push(result),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable backup entry");
                }
            }
        }

        sort_oldest_first(&mut items);
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use chrono::Utc;
    use serde_json::json;

    fn result() -> QueuedTaskResult {
        QueuedTaskResult::new(&NewTask::new("noop", json!({})).into_queued(Utc::now()))
    }

    #[tokio::test]
    async fn test_in_memory_put_is_idempotent() {
        let backup = InMemoryResultQueueBackup::new();
        let result = result();

        backup.put(&result).await.unwrap();
        backup.put(&result).await.unwrap();

        let items = backup.retrieve_backed_up_items().await.unwrap();
        assert_eq!(items, vec![result.clone()]);

        backup.remove(result.id).await.unwrap();
        backup.remove(result.id).await.unwrap();
        assert!(backup.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_put_replaces_entry() {
        let backup = InMemoryResultQueueBackup::new();
        let mut result = result();
        backup.put(&result).await.unwrap();

        result.fault_count = 2;
        backup.put(&result).await.unwrap();

        let items = backup.retrieve_backed_up_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].fault_count, 2);
    }

    #[tokio::test]
    async fn test_file_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileResultQueueBackup::new(dir.path().join("results"));
        backup.init().await.unwrap();

        let first = result();
        let second = result();
        backup.put(&first).await.unwrap();
        backup.put(&second).await.unwrap();
        backup.put(&first).await.unwrap();

        let items = backup.retrieve_backed_up_items().await.unwrap();
        assert_eq!(items.len(), 2);

        backup.remove(first.id).await.unwrap();
        let items = backup.retrieve_backed_up_items().await.unwrap();
        assert_eq!(items, vec![second]);
    }

    #[tokio::test]
    async fn test_file_backup_init_clears_temp_files_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("partial.tmp"), b"{").unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"not json").unwrap();

        let backup = FileResultQueueBackup::new(dir.path());
        backup.init().await.unwrap();

        assert!(!dir.path().join("partial.tmp").exists());
        assert!(backup.retrieve_backed_up_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_backup_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backup = FileResultQueueBackup::new(dir.path().join("never-created"));
        assert!(backup.retrieve_backed_up_items().await.unwrap().is_empty());
        backup.remove(Uuid::now_v7()).await.unwrap();
    }
}
