use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::poll::{OwnerId, PollState};

/// Persistence surface for poll state. All operations are keyed by owner and
/// idempotent; only the owning scheduler job writes a given user's row, so
/// last-writer-wins per row is enough.
#[async_trait]
pub trait PollStore: Send + Sync {
    /// Polls whose push flag is raised, for start-up restoration.
    async fn load_active_polls(&self) -> Result<Vec<PollState>>;

    /// Persists the poll and raises its push flag.
    async fn save_poll(&self, poll: &PollState) -> Result<()>;

    async fn set_push_flag(&self, owner_id: OwnerId, push: bool) -> Result<()>;

    /// Drops the stored session credential, keeping the rest of the row.
    async fn clear_session(&self, owner_id: OwnerId) -> Result<()>;

    /// Every stored non-empty session credential, for the keep-alive sweep.
    async fn stored_sessions(&self) -> Result<Vec<(OwnerId, String)>>;
}

/// One user's persisted row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRecord {
    pub push: bool,
    pub poll: PollState,
}

/// JSON-file-per-user store under a data directory.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        if !data_dir.exists() {
            fs::create_dir_all(&data_dir).context("failed to create data directory")?;
            info!("created data directory: {path}", path = data_dir.display());
        }
        Ok(Self { data_dir })
    }

    fn record_path(&self, owner_id: OwnerId) -> PathBuf {
        self.data_dir.join(format!("poll_{owner_id}.json"))
    }

    fn read_record(path: &Path) -> Result<PollRecord> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read poll record {path}", path = path.display()))?;
        serde_json::from_str(&json).with_context(|| {
            format!("failed to parse poll record {path}", path = path.display())
        })
    }

    fn write_record(&self, record: &PollRecord) -> Result<()> {
        let path = self.record_path(record.poll.owner_id);
        let json =
            serde_json::to_string_pretty(record).context("failed to serialize poll record")?;
        fs::write(&path, json)
            .with_context(|| format!("failed to write poll record {path}", path = path.display()))
    }

    fn load_record(&self, owner_id: OwnerId) -> Result<Option<PollRecord>> {
        let path = self.record_path(owner_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    /// Every persisted row, active or not. Used by operational commands.
    pub fn list_records(&self) -> Result<Vec<PollRecord>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.data_dir).with_context(|| {
            format!(
                "failed to list data directory {path}",
                path = self.data_dir.display()
            )
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with("poll_") || !name.ends_with(".json") {
                continue;
            }
            records.push(Self::read_record(&path)?);
        }
        records.sort_by_key(|record| record.poll.owner_id);
        Ok(records)
    }
}

#[async_trait]
impl PollStore for FileStore {
    async fn load_active_polls(&self) -> Result<Vec<PollState>> {
        let polls: Vec<PollState> = self
            .list_records()?
            .into_iter()
            .filter(|record| record.push)
            .map(|record| record.poll)
            .collect();
        debug!("loaded {count} active polls", count = polls.len());
        Ok(polls)
    }

    async fn save_poll(&self, poll: &PollState) -> Result<()> {
        self.write_record(&PollRecord {
            push: true,
            poll: poll.clone(),
        })
    }

    async fn set_push_flag(&self, owner_id: OwnerId, push: bool) -> Result<()> {
        match self.load_record(owner_id)? {
            Some(mut record) => {
                record.push = push;
                self.write_record(&record)
            }
            None => {
                // Nothing persisted for this user yet; flagging an absent
                // row off is a no-op.
                debug!("no poll record for user {owner_id}, push flag not persisted");
                Ok(())
            }
        }
    }

    async fn clear_session(&self, owner_id: OwnerId) -> Result<()> {
        match self.load_record(owner_id)? {
            Some(mut record) => {
                record.poll.session_credential = None;
                self.write_record(&record)
            }
            None => Ok(()),
        }
    }

    async fn stored_sessions(&self) -> Result<Vec<(OwnerId, String)>> {
        Ok(self
            .list_records()?
            .into_iter()
            .filter_map(|record| {
                let credential = record.poll.session_credential?;
                if credential.is_empty() {
                    return None;
                }
                Some((record.poll.owner_id, credential))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Destination;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn poll(owner_id: OwnerId) -> PollState {
        PollState::new(owner_id, Destination::private(owner_id), format!("s{owner_id}"))
    }

    #[tokio::test]
    async fn saved_polls_come_back_active() {
        let (_dir, store) = store();
        store.save_poll(&poll(1)).await.unwrap();
        store.save_poll(&poll(2)).await.unwrap();

        let active = store.load_active_polls().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].owner_id, 1);
        assert_eq!(active[1].owner_id, 2);
    }

    #[tokio::test]
    async fn lowered_push_flag_hides_the_poll() {
        let (_dir, store) = store();
        store.save_poll(&poll(1)).await.unwrap();
        store.set_push_flag(1, false).await.unwrap();

        assert!(store.load_active_polls().await.unwrap().is_empty());
        // The row itself survives, only the flag moved.
        assert_eq!(store.list_records().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn set_push_flag_is_idempotent_and_tolerates_missing_rows() {
        let (_dir, store) = store();
        store.set_push_flag(99, false).await.unwrap();
        store.save_poll(&poll(1)).await.unwrap();
        store.set_push_flag(1, false).await.unwrap();
        store.set_push_flag(1, false).await.unwrap();
        assert!(store.load_active_polls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_poll_raises_the_flag_again() {
        let (_dir, store) = store();
        store.save_poll(&poll(1)).await.unwrap();
        store.set_push_flag(1, false).await.unwrap();
        store.save_poll(&poll(1)).await.unwrap();
        assert_eq!(store.load_active_polls().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleared_session_disappears_from_sweep_set() {
        let (_dir, store) = store();
        store.save_poll(&poll(1)).await.unwrap();
        store.save_poll(&poll(2)).await.unwrap();

        store.clear_session(1).await.unwrap();

        let sessions = store.stored_sessions().await.unwrap();
        assert_eq!(sessions, vec![(2, "s2".to_string())]);

        // Clearing again (or clearing an absent row) stays fine.
        store.clear_session(1).await.unwrap();
        store.clear_session(42).await.unwrap();
    }

    #[tokio::test]
    async fn persisted_state_round_trips() {
        let (_dir, store) = store();
        let mut p = poll(7);
        p.record_outcome(true);
        p.last_seen_battle_id = Some(101);
        p.last_notification_message_id = Some(55);
        store.save_poll(&p).await.unwrap();

        let loaded = store.load_active_polls().await.unwrap();
        assert_eq!(loaded, vec![p]);
    }
}
