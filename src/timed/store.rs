//! Expiry store
//!
//! In-memory index of timed records for one namespace, written through to a
//! `RecordBackend`. Mutations are serialized by a per-store lock and only land
//! in memory after the backend accepted them, so memory never claims a record
//! that storage lost.

use super::{MemoryBackend, RecordBackend, StoreResult, TimedRecord};
use crate::SWEEP_TARGET;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Persisted mapping from record id to due record
#[derive(Clone)]
pub struct ExpiryStore {
    namespace: Arc<str>,
    records: Arc<DashMap<String, TimedRecord>>,
    backend: Arc<dyn RecordBackend>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ExpiryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryStore")
            .field("namespace", &self.namespace)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl ExpiryStore {
    /// Open a store and load whatever the backend already holds
    ///
    /// # Errors
    /// Returns the backend's error if existing records cannot be read
    pub async fn open(namespace: &str, backend: Arc<dyn RecordBackend>) -> StoreResult<Self> {
        let records = DashMap::new();
        for record in backend.load().await? {
            records.insert(record.id.clone(), record);
        }

        info!(
            target: SWEEP_TARGET,
            namespace = %namespace,
            records = records.len(),
            "Timer store opened"
        );

        Ok(Self {
            namespace: namespace.into(),
            records: Arc::new(records),
            backend,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Store that lives only in memory
    #[must_use]
    pub fn in_memory(namespace: &str) -> Self {
        Self {
            namespace: namespace.into(),
            records: Arc::new(DashMap::new()),
            backend: Arc::new(MemoryBackend::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Persist a record, assigning an id if it has none
    ///
    /// # Errors
    /// Returns the backend's error; the record is then not held in memory either
    pub async fn add(&self, record: TimedRecord) -> StoreResult<String> {
        let _guard = self.write_lock.lock().await;
        self.insert_locked(record).await
    }

    async fn insert_locked(&self, mut record: TimedRecord) -> StoreResult<String> {
        let id = record.ensure_id().to_string();

        self.backend.upsert(&record).await?;

        info!(
            target: SWEEP_TARGET,
            namespace = %self.namespace,
            record_id = %id,
            kind = %record.kind,
            due_at = %record.due_at,
            recurrence_seconds = ?record.recurrence_seconds,
            "Timed record added"
        );
        self.records.insert(id.clone(), record);
        Ok(id)
    }

    /// Persist a record unless an existing one matches `exists`
    ///
    /// The check and the write happen under the store lock, so concurrent
    /// callers racing on the same predicate add at most one record.
    ///
    /// # Errors
    /// Returns the backend's error; nothing is added then
    pub async fn add_unless<F>(&self, record: TimedRecord, exists: F) -> StoreResult<Option<String>>
    where
        F: Fn(&TimedRecord) -> bool + Send,
    {
        let _guard = self.write_lock.lock().await;
        if self.records.iter().any(|entry| exists(entry.value())) {
            return Ok(None);
        }
        self.insert_locked(record).await.map(Some)
    }

    /// Delete a record
    ///
    /// Returns `false` without touching storage when the id is unknown, which
    /// happens whenever a cancellation races the sweeper.
    ///
    /// # Errors
    /// Returns the backend's error; the record then stays in place
    pub async fn remove(&self, id: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        if !self.records.contains_key(id) {
            return Ok(false);
        }

        self.backend.delete(id).await?;
        self.records.remove(id);

        info!(
            target: SWEEP_TARGET,
            namespace = %self.namespace,
            record_id = %id,
            "Timed record removed"
        );
        Ok(true)
    }

    /// Move a record to a new due time
    ///
    /// Returns `false` and logs if the record is gone.
    ///
    /// # Errors
    /// Returns the backend's error; the old due time then stays in effect
    pub async fn reschedule(&self, id: &str, due_at: DateTime<Utc>) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.records.get(id).map(|r| r.value().clone()) else {
            warn!(
                target: SWEEP_TARGET,
                namespace = %self.namespace,
                record_id = %id,
                "Cannot reschedule missing record"
            );
            return Ok(false);
        };

        record.due_at = due_at;
        self.backend.upsert(&record).await?;
        self.records.insert(id.to_string(), record);

        info!(
            target: SWEEP_TARGET,
            namespace = %self.namespace,
            record_id = %id,
            due_at = %due_at,
            "Timed record rescheduled"
        );
        Ok(true)
    }

    /// Records due at or before `now`, in no particular order
    pub fn due_before(&self, now: DateTime<Utc>) -> Vec<TimedRecord> {
        self.records
            .iter()
            .filter(|entry| entry.value().is_due(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<TimedRecord> {
        self.records.get(id).map(|r| r.value().clone())
    }

    /// Every record, soonest first
    pub fn list(&self) -> Vec<TimedRecord> {
        let mut all: Vec<TimedRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        all.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    /// Records whose payload field `key` equals `value`
    pub fn find_by_payload(&self, key: &str, value: &serde_json::Value) -> Vec<TimedRecord> {
        self.records
            .iter()
            .filter(|r| r.value().payload.get(key) == Some(value))
            .map(|r| r.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timed::{RecordKind, StoreError};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 9, 0, 0).unwrap()
    }

    fn ban(secs: i64) -> TimedRecord {
        TimedRecord::new(RecordKind::TempBan, t0() + Duration::seconds(secs), json!({"guild_id": 1}))
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_persists() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ExpiryStore::open("temp_bans", backend.clone()).await.unwrap();

        let id = store.add(ban(10)).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(store.get(&id).unwrap().id, id);
        assert_eq!(backend.persisted().len(), 1);
    }

    #[tokio::test]
    async fn test_add_keeps_caller_id() {
        let store = ExpiryStore::in_memory("reminders");
        let mut record = ban(0);
        record.id = "fixed".to_string();
        assert_eq!(store.add(record).await.unwrap(), "fixed");
    }

    #[tokio::test]
    async fn test_persistence_errors_reach_caller() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ExpiryStore::open("temp_bans", backend.clone()).await.unwrap();
        let kept = store.add(ban(5)).await.unwrap();

        backend.set_failing(true);
        assert!(matches!(store.add(ban(10)).await, Err(StoreError::Backend(_))));
        assert!(store.remove(&kept).await.is_err());
        assert!(store.reschedule(&kept, t0()).await.is_err());

        // Nothing changed in memory
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&kept).unwrap().due_at, t0() + Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_remove_missing_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let store = ExpiryStore::open("temp_bans", backend.clone()).await.unwrap();
        assert!(!store.remove("nope").await.unwrap());
        assert_eq!(backend.writes(), 0);
    }

    #[tokio::test]
    async fn test_reschedule_missing_returns_false() {
        let store = ExpiryStore::in_memory("reminders");
        assert!(!store.reschedule("gone", t0()).await.unwrap());
    }

    #[tokio::test]
    async fn test_due_before_inclusive() {
        let store = ExpiryStore::in_memory("temp_bans");
        let due_now = store.add(ban(0)).await.unwrap();
        let past = store.add(ban(-30)).await.unwrap();
        store.add(ban(1)).await.unwrap();

        let mut due: Vec<String> = store.due_before(t0()).into_iter().map(|r| r.id).collect();
        due.sort();
        let mut expected = vec![due_now, past];
        expected.sort();
        assert_eq!(due, expected);
    }

    #[tokio::test]
    async fn test_open_loads_existing_records() {
        let mut existing = ban(100);
        existing.id = "persisted".to_string();
        let backend = Arc::new(MemoryBackend::with_records([existing.clone()]));

        let store = ExpiryStore::open("temp_bans", backend).await.unwrap();
        assert_eq!(store.list(), vec![existing]);
    }

    /// Backend whose writes take a while, widening any check-then-add gap
    struct SlowBackend(MemoryBackend);

    #[async_trait::async_trait]
    impl RecordBackend for SlowBackend {
        async fn load(&self) -> StoreResult<Vec<TimedRecord>> {
            self.0.load().await
        }

        async fn upsert(&self, record: &TimedRecord) -> StoreResult<()> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.0.upsert(record).await
        }

        async fn delete(&self, id: &str) -> StoreResult<()> {
            self.0.delete(id).await
        }
    }

    #[tokio::test]
    async fn test_add_unless_is_atomic_under_concurrency() {
        let store = ExpiryStore::open("birthdays", Arc::new(SlowBackend(MemoryBackend::new())))
            .await
            .unwrap();
        let same_guild = |r: &TimedRecord| r.payload.get("guild_id") == Some(&json!(1));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.add_unless(ban(0), same_guild).await.unwrap() })
            })
            .collect();
        let mut added = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                added += 1;
            }
        }

        assert_eq!(added, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_find_by_payload() {
        let store = ExpiryStore::in_memory("temp_mutes");
        store
            .add(TimedRecord::new(RecordKind::TempMute, t0(), json!({"user_id": 5})))
            .await
            .unwrap();
        store
            .add(TimedRecord::new(RecordKind::TempMute, t0(), json!({"user_id": 6})))
            .await
            .unwrap();

        let found = store.find_by_payload("user_id", &json!(5));
        assert_eq!(found.len(), 1);
    }
}
