//! Persistence backends for `ExpiryStore`
//!
//! Each store namespace owns one backend. Writes to a backend are serialized
//! through its own lock, and the YAML backend replaces its file atomically
//! (write to a temporary sibling, then rename), so two sweepers writing
//! different namespaces never touch the same file and a crash mid-write never
//! leaves a truncated file behind.

use super::{StoreError, StoreResult, TimedRecord};
use crate::SWEEP_TARGET;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Durable storage for one namespace of timed records
#[async_trait::async_trait]
pub trait RecordBackend: Send + Sync {
    /// Read every persisted record
    async fn load(&self) -> StoreResult<Vec<TimedRecord>>;

    /// Insert or replace a record by id
    async fn upsert(&self, record: &TimedRecord) -> StoreResult<()>;

    /// Delete a record; absent ids are not an error
    async fn delete(&self, id: &str) -> StoreResult<()>;
}

/// Volatile backend for tests and ephemeral namespaces
///
/// Can be switched into a failing mode to exercise error propagation.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: StdMutex<BTreeMap<String, TimedRecord>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the backend as if the records had been persisted earlier
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = TimedRecord>) -> Self {
        let backend = Self::new();
        {
            let mut map = backend.lock();
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        backend
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful writes
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Snapshot of what is persisted
    pub fn persisted(&self) -> Vec<TimedRecord> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TimedRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("memory backend set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordBackend for MemoryBackend {
    async fn load(&self) -> StoreResult<Vec<TimedRecord>> {
        Ok(self.persisted())
    }

    async fn upsert(&self, record: &TimedRecord) -> StoreResult<()> {
        self.check_writable()?;
        self.lock().insert(record.id.clone(), record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.check_writable()?;
        self.lock().remove(id);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One YAML file per namespace, e.g. `data/timers/temp_bans.yaml`
#[derive(Debug)]
pub struct YamlFileBackend {
    path: PathBuf,
    /// Cached file contents; `None` until first access
    records: Mutex<Option<BTreeMap<String, TimedRecord>>>,
}

impl YamlFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// File for `namespace` under `dir`
    pub fn in_dir(dir: impl AsRef<Path>, namespace: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{namespace}.yaml")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> StoreResult<BTreeMap<String, TimedRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let records: Vec<TimedRecord> = serde_yaml::from_str(&content)
            .map_err(|e| StoreError::Deserialize(format!("{}: {e}", self.path.display())))?;
        Ok(records.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    async fn write_file(&self, records: &BTreeMap<String, TimedRecord>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let list: Vec<&TimedRecord> = records.values().collect();
        let yaml = serde_yaml::to_string(&list).map_err(|e| StoreError::Serialize(e.to_string()))?;

        let tmp = self.path.with_extension("yaml.tmp");
        tokio::fs::write(&tmp, yaml).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(target: SWEEP_TARGET, path = %self.path.display(), records = records.len(), "Timer file written");
        Ok(())
    }

    /// Apply `change` to a copy of the records and commit it only if the file
    /// write succeeds
    async fn modify<F>(&self, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, TimedRecord>) + Send,
    {
        let mut guard = self.records.lock().await;
        let mut next = match guard.as_ref() {
            Some(records) => records.clone(),
            None => self.read_file().await?,
        };
        change(&mut next);
        self.write_file(&next).await?;
        *guard = Some(next);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RecordBackend for YamlFileBackend {
    async fn load(&self) -> StoreResult<Vec<TimedRecord>> {
        let mut guard = self.records.lock().await;
        let records = self.read_file().await?;
        let list = records.values().cloned().collect();
        *guard = Some(records);
        Ok(list)
    }

    async fn upsert(&self, record: &TimedRecord) -> StoreResult<()> {
        if record.id.is_empty() {
            return Err(StoreError::InvalidRecord("record has no id".to_string()));
        }
        let record = record.clone();
        self.modify(move |records| {
            records.insert(record.id.clone(), record);
        })
        .await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.modify(move |records| {
            records.remove(&id);
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timed::RecordKind;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("guild-warden-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record(id: &str) -> TimedRecord {
        let due = Utc.with_ymd_and_hms(2024, 2, 2, 2, 2, 2).unwrap();
        let mut record = TimedRecord::new(RecordKind::TempBan, due, json!({"guild_id": 1, "user_id": 2}));
        record.id = id.to_string();
        record
    }

    #[tokio::test]
    async fn test_yaml_backend_roundtrip_through_new_instance() {
        let dir = temp_dir("roundtrip");
        let backend = YamlFileBackend::in_dir(&dir, "temp_bans");

        backend.upsert(&record("a")).await.unwrap();
        backend.upsert(&record("b")).await.unwrap();
        backend.delete("a").await.unwrap();
        // Deleting something absent is fine
        backend.delete("zzz").await.unwrap();

        let reopened = YamlFileBackend::in_dir(&dir, "temp_bans");
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, vec![record("b")]);
        assert!(!dir.join("temp_bans.yaml.tmp").exists());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_yaml_backend_missing_file_is_empty() {
        let dir = temp_dir("missing");
        let backend = YamlFileBackend::in_dir(dir.join("nested"), "reminders");
        assert!(backend.load().await.unwrap().is_empty());
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_yaml_backend_corrupt_file_is_an_error() {
        let dir = temp_dir("corrupt");
        std::fs::write(dir.join("giveaways.yaml"), "this: [is not, a record list").unwrap();
        let backend = YamlFileBackend::in_dir(&dir, "giveaways");
        assert!(matches!(backend.load().await, Err(StoreError::Deserialize(_))));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_yaml_backend_rejects_missing_id() {
        let dir = temp_dir("noid");
        let backend = YamlFileBackend::in_dir(&dir, "temp_mutes");
        let mut nameless = record("x");
        nameless.id.clear();
        assert!(matches!(
            backend.upsert(&nameless).await,
            Err(StoreError::InvalidRecord(_))
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_memory_backend_failure_mode() {
        let backend = MemoryBackend::new();
        backend.upsert(&record("a")).await.unwrap();

        backend.set_failing(true);
        assert!(backend.upsert(&record("b")).await.is_err());
        assert!(backend.delete("a").await.is_err());

        backend.set_failing(false);
        assert_eq!(backend.persisted(), vec![record("a")]);
        assert_eq!(backend.writes(), 1);
    }
}
