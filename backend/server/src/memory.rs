//! In-process store for local runs (`STORE_BACKEND=memory`) and tests.
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    coordinate::LiveReading,
    store::{BackupRecord, BackupStore, FleetListing, LiveSource, StoreError, UpsertOutcome},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    fleet: RwLock<Vec<String>>,
    live: RwLock<HashMap<String, LiveReading>>,
    backups: RwLock<BTreeMap<String, BackupRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a bin to the fleet listing. Enumeration keeps first-seen order.
    pub async fn register_bin(&self, bin_id: &str) {
        let mut fleet = self.fleet.write().await;

        if !fleet.iter().any(|id| id == bin_id) {
            fleet.push(bin_id.to_string());
        }
    }

    /// Stands in for the ingestion path.
    pub async fn set_live(&self, bin_id: &str, reading: LiveReading) {
        self.register_bin(bin_id).await;
        self.live.write().await.insert(bin_id.to_string(), reading);
    }

    pub async fn clear_live(&self, bin_id: &str) {
        self.live.write().await.remove(bin_id);
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn get(&self, bin_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        Ok(self.backups.read().await.get(bin_id).cloned())
    }

    async fn upsert(
        &self,
        bin_id: &str,
        record: BackupRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut backups = self.backups.write().await;

        if let Some(current) = backups.get(bin_id) {
            if record.coordinate.timestamp() <= current.coordinate.timestamp() {
                return Ok(UpsertOutcome::Stale);
            }
        }

        backups.insert(bin_id.to_string(), record);

        Ok(UpsertOutcome::Committed)
    }

    async fn list(&self) -> Result<Vec<(String, BackupRecord)>, StoreError> {
        Ok(self
            .backups
            .read()
            .await
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect())
    }
}

#[async_trait]
impl LiveSource for MemoryStore {
    async fn live_reading(&self, bin_id: &str) -> Result<Option<LiveReading>, StoreError> {
        Ok(self.live.read().await.get(bin_id).copied())
    }
}

#[async_trait]
impl FleetListing for MemoryStore {
    async fn list_bin_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.fleet.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::coordinate::Coordinate;

    fn record(secs: i64) -> BackupRecord {
        let timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        BackupRecord::new(Coordinate::new(10.0, 20.0, timestamp).unwrap(), "scheduled")
    }

    #[tokio::test]
    async fn test_older_write_is_stale() {
        let store = MemoryStore::new();

        assert_eq!(
            store.upsert("A", record(100)).await.unwrap(),
            UpsertOutcome::Committed
        );
        assert_eq!(
            store.upsert("A", record(50)).await.unwrap(),
            UpsertOutcome::Stale
        );

        let stored = store.get("A").await.unwrap().unwrap();
        assert_eq!(stored.coordinate.timestamp().timestamp(), 100);
    }

    #[tokio::test]
    async fn test_newer_write_commits() {
        let store = MemoryStore::new();

        store.upsert("A", record(100)).await.unwrap();
        assert_eq!(
            store.upsert("A", record(150)).await.unwrap(),
            UpsertOutcome::Committed
        );

        let stored = store.get("A").await.unwrap().unwrap();
        assert_eq!(stored.coordinate.timestamp().timestamp(), 150);
    }

    #[tokio::test]
    async fn test_equal_timestamp_is_stale() {
        let store = MemoryStore::new();

        store.upsert("A", record(100)).await.unwrap();
        assert_eq!(
            store.upsert("A", record(100)).await.unwrap(),
            UpsertOutcome::Stale
        );
    }

    #[tokio::test]
    async fn test_same_millisecond_is_stale() {
        let store = MemoryStore::new();
        let base = Utc.timestamp_millis_opt(1_700_000_000_500).unwrap();
        let within = |nanos| {
            let timestamp = base + chrono::Duration::nanoseconds(nanos);
            BackupRecord::new(Coordinate::new(10.0, 20.0, timestamp).unwrap(), "scheduled")
        };

        store.upsert("A", within(100)).await.unwrap();
        assert_eq!(
            store.upsert("A", within(900_000)).await.unwrap(),
            UpsertOutcome::Stale
        );
    }

    #[tokio::test]
    async fn test_missing_backup_is_absent() {
        let store = MemoryStore::new();

        assert!(store.get("nope").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fleet_keeps_first_seen_order() {
        let store = MemoryStore::new();

        store.register_bin("C").await;
        store.register_bin("A").await;
        store.register_bin("C").await;

        assert_eq!(store.list_bin_ids().await.unwrap(), vec!["C", "A"]);
    }
}
