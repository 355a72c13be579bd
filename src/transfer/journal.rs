//! Resume Journal (C10): durable per-transfer state so an in-flight SFTP
//! transfer can resume after a process restart.
//!
//! Grounded on the teacher's `session/recording.rs` JSONL writer (atomic
//! append-then-flush to a user-data file) generalized from "append-only
//! session log" to "one file per active record, rewritten atomically via a
//! temp-then-rename", since a resumable transfer needs its latest snapshot
//! rather than a history of every prior one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};

use super::{TransferRecord, TransferState};

/// Tracks, per transfer id, when it was last persisted so the engine can
/// honor the "≥1 MiB delta or ≥5 s elapsed" persistence cadence without
/// writing to disk on every chunk.
struct JournalCursor {
    last_persisted_bytes: u64,
    last_persisted_at: std::time::Instant,
}

pub struct ResumeJournal {
    directory: PathBuf,
    progress_delta_bytes: u64,
    progress_interval: Duration,
    completed_retention: Duration,
    cancelled_retention: Duration,
    cursors: Mutex<std::collections::HashMap<String, JournalCursor>>,
}

impl ResumeJournal {
    pub fn new(
        directory: PathBuf,
        progress_delta_bytes: u64,
        progress_interval: Duration,
        completed_retention: Duration,
        cancelled_retention: Duration,
    ) -> Self {
        Self {
            directory,
            progress_delta_bytes,
            progress_interval,
            completed_retention,
            cancelled_retention,
            cursors: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}.json"))
    }

    /// Ensures the journal directory exists before first use.
    pub async fn ensure_directory(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(EngineError::from)
    }

    /// Persists `record` if its progress has advanced by the configured
    /// byte delta or enough wall-clock time has passed since the last
    /// write. Always persists unconditionally on state transitions away
    /// from `Transferring` (callers typically call this from the progress
    /// path; terminal-state writes go through `persist_now`).
    pub async fn maybe_persist(&self, record: Arc<Mutex<TransferRecord>>) {
        let (id, transferred, state) = {
            let record = record.lock().await;
            (record.id.clone(), record.transferred_bytes, record.state)
        };

        let should_write = {
            let mut cursors = self.cursors.lock().await;
            let cursor = cursors.entry(id.clone()).or_insert(JournalCursor {
                last_persisted_bytes: 0,
                last_persisted_at: std::time::Instant::now(),
            });
            let delta = transferred.saturating_sub(cursor.last_persisted_bytes);
            let elapsed = cursor.last_persisted_at.elapsed();
            let due = delta >= self.progress_delta_bytes || elapsed >= self.progress_interval;
            if due {
                cursor.last_persisted_bytes = transferred;
                cursor.last_persisted_at = std::time::Instant::now();
            }
            due
        };

        if !should_write && !matches!(state, TransferState::Completed | TransferState::Cancelled | TransferState::Failed) {
            return;
        }

        let snapshot = record.lock().await.clone();
        if let Err(err) = self.persist_now(&snapshot).await {
            warn!("journal: failed to persist transfer {id}: {err}");
        }
    }

    /// Writes `record` to disk immediately via write-temp-then-rename.
    pub async fn persist_now(&self, record: &TransferRecord) -> Result<()> {
        self.ensure_directory().await?;
        let final_path = self.path_for(&record.id);
        let temp_path = self.directory.join(format!("{}.json.tmp", record.id));
        let body = serde_json::to_vec_pretty(record).map_err(EngineError::from)?;
        tokio::fs::write(&temp_path, &body).await.map_err(EngineError::from)?;
        tokio::fs::rename(&temp_path, &final_path).await.map_err(EngineError::from)?;
        Ok(())
    }

    /// Loads every journaled record whose state is resumable (i.e. not
    /// `Completed` or `Cancelled`, which are discarded per spec.md §4.10).
    pub async fn load_resumable(&self) -> Result<Vec<TransferRecord>> {
        self.ensure_directory().await?;
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.directory).await.map_err(EngineError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(EngineError::from)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_record(&path).await {
                Ok(record) => {
                    if matches!(record.state, TransferState::Completed | TransferState::Cancelled) {
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                    out.push(record);
                }
                Err(err) => {
                    warn!("journal: skipping unreadable record at {}: {err}", path.display());
                }
            }
        }
        Ok(out)
    }

    /// Schedules deletion of a completed transfer's journal file after the
    /// configured retention delay (default 24 h), so a completed record
    /// remains briefly inspectable before cleanup.
    pub fn schedule_completed_cleanup(&self, id: String) {
        self.schedule_cleanup(id, self.completed_retention);
    }

    /// Schedules deletion of a cancelled transfer's journal file after the
    /// configured retention delay (default 5 s).
    pub fn schedule_cancelled_cleanup(&self, id: String) {
        self.schedule_cleanup(id, self.cancelled_retention);
    }

    fn schedule_cleanup(&self, id: String, delay: Duration) {
        let path = self.path_for(&id);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = tokio::fs::remove_file(&path).await
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!("journal: failed to clean up {}: {err}", path.display());
            } else {
                debug!("journal: cleaned up {}", path.display());
            }
        });
    }
}

async fn load_record(path: &Path) -> Result<TransferRecord> {
    let body = tokio::fs::read(path).await.map_err(EngineError::from)?;
    serde_json::from_slice(&body).map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferKind;

    fn test_record(id: &str, state: TransferState) -> TransferRecord {
        let mut record = TransferRecord::new(
            id.to_string(),
            TransferKind::Upload,
            "/local".to_string(),
            "/remote".to_string(),
            "tab1".to_string(),
            "key".to_string(),
            false,
            None,
        );
        record.state = state;
        record.total_bytes = 100;
        record.transferred_bytes = 50;
        record
    }

    #[tokio::test]
    async fn persist_then_load_round_trips_a_resumable_record() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResumeJournal::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(60 * 60 * 24),
            Duration::from_secs(5),
        );
        let record = test_record("abc", TransferState::Paused);
        journal.persist_now(&record).await.unwrap();

        let loaded = journal.load_resumable().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "abc");
        assert_eq!(loaded[0].transferred_bytes, 50);
    }

    #[tokio::test]
    async fn load_resumable_discards_completed_and_cancelled_records() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResumeJournal::new(
            dir.path().to_path_buf(),
            1024 * 1024,
            Duration::from_secs(5),
            Duration::from_secs(60 * 60 * 24),
            Duration::from_secs(5),
        );
        journal.persist_now(&test_record("done", TransferState::Completed)).await.unwrap();
        journal.persist_now(&test_record("gone", TransferState::Cancelled)).await.unwrap();
        journal.persist_now(&test_record("paused", TransferState::Paused)).await.unwrap();

        let loaded = journal.load_resumable().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "paused");
        assert!(!dir.path().join("done.json").exists());
        assert!(!dir.path().join("gone.json").exists());
    }

    #[tokio::test]
    async fn maybe_persist_skips_small_deltas_before_interval_elapses() {
        let dir = tempfile::tempdir().unwrap();
        let journal = ResumeJournal::new(
            dir.path().to_path_buf(),
            10 * 1024 * 1024,
            Duration::from_secs(60 * 60),
            Duration::from_secs(60 * 60 * 24),
            Duration::from_secs(5),
        );
        let record = Arc::new(Mutex::new(test_record("small", TransferState::Transferring)));
        {
            let mut guard = record.lock().await;
            guard.transferred_bytes = 1;
        }
        journal.maybe_persist(record.clone()).await;
        assert!(!dir.path().join("small.json").exists());
    }
}
