//! # Display coordinates
//!
//! Answers "where is this bin right now". A usable live reading always wins; otherwise
//! the stored backup is shown; otherwise the answer is explicitly absent. Nothing is
//! cached, so every call reflects the current store.
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::{
    clock::Clock,
    coordinate::{Coordinate, LivePolicy},
    store::{BackupRecord, BackupStore, LiveSource, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplaySource {
    Live,
    Backup,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DisplayCoordinate {
    pub coordinate: Coordinate,
    pub source: DisplaySource,
}

/// Pure decision over an already-checked live coordinate and the stored backup.
pub fn decide(
    live: Option<Coordinate>,
    backup: Option<&BackupRecord>,
) -> Option<DisplayCoordinate> {
    if let Some(coordinate) = live {
        return Some(DisplayCoordinate {
            coordinate,
            source: DisplaySource::Live,
        });
    }

    backup.map(|record| DisplayCoordinate {
        coordinate: record.coordinate,
        source: DisplaySource::Backup,
    })
}

pub fn display_source(decision: Option<&DisplayCoordinate>) -> DisplaySource {
    decision.map_or(DisplaySource::None, |display| display.source)
}

#[derive(Clone)]
pub struct Arbiter {
    store: Arc<dyn BackupStore>,
    live: Arc<dyn LiveSource>,
    clock: Arc<dyn Clock>,
    policy: LivePolicy,
}

impl Arbiter {
    pub fn new(
        store: Arc<dyn BackupStore>,
        live: Arc<dyn LiveSource>,
        clock: Arc<dyn Clock>,
        policy: LivePolicy,
    ) -> Self {
        Self {
            store,
            live,
            clock,
            policy,
        }
    }

    /// Live coordinate if the reading is valid and inside the freshness window.
    ///
    /// An unreachable live source is logged and treated as "no usable live reading".
    pub async fn usable_live(&self, bin_id: &str) -> Option<Coordinate> {
        match self.live.live_reading(bin_id).await {
            Ok(reading) => reading.and_then(|r| self.policy.usable(&r, self.clock.now())),
            Err(e) => {
                warn!(bin_id, error = %e, "Live source unreachable, falling back to backup");
                None
            }
        }
    }

    pub async fn display_coordinate(
        &self,
        bin_id: &str,
    ) -> Result<Option<DisplayCoordinate>, StoreError> {
        if let Some(live) = self.usable_live(bin_id).await {
            return Ok(decide(Some(live), None));
        }

        let backup = self.store.get(bin_id).await?;

        Ok(decide(None, backup.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::*;
    use crate::{
        clock::ManualClock,
        coordinate::LiveReading,
        memory::MemoryStore,
        store::{SOURCE_SCHEDULED, StoreError},
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn backup(lat: f64, lon: f64, secs: i64) -> BackupRecord {
        BackupRecord::new(Coordinate::new(lat, lon, at(secs)).unwrap(), SOURCE_SCHEDULED)
    }

    fn arbiter(store: Arc<MemoryStore>, freshness: Option<Duration>) -> Arbiter {
        Arbiter::new(
            store.clone(),
            store,
            Arc::new(ManualClock::new(at(200))),
            LivePolicy::new(freshness),
        )
    }

    struct DownLive;

    #[async_trait]
    impl LiveSource for DownLive {
        async fn live_reading(&self, _: &str) -> Result<Option<LiveReading>, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_decide_prefers_live() {
        let live = Coordinate::new(10.0, 20.0, at(100)).unwrap();
        let decision = decide(Some(live), Some(&backup(5.0, 5.0, 50))).unwrap();

        assert_eq!(decision.source, DisplaySource::Live);
        assert_eq!(decision.coordinate, live);
    }

    #[test]
    fn test_decide_falls_back_and_reports_none() {
        let decision = decide(None, Some(&backup(5.0, 5.0, 50))).unwrap();
        assert_eq!(decision.source, DisplaySource::Backup);

        assert!(decide(None, None).is_none());
        assert_eq!(display_source(None), DisplaySource::None);
    }

    #[tokio::test]
    async fn test_valid_live_wins() {
        let store = Arc::new(MemoryStore::new());
        store.set_live("A", LiveReading::new(10.0, 20.0, at(100))).await;
        store.upsert("A", backup(5.0, 5.0, 50)).await.unwrap();

        let display = arbiter(store, None)
            .display_coordinate("A")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(display.source, DisplaySource::Live);
        assert_eq!(display.coordinate.latitude(), 10.0);
        assert_eq!(display.coordinate.longitude(), 20.0);
    }

    #[tokio::test]
    async fn test_absent_live_uses_backup() {
        let store = Arc::new(MemoryStore::new());
        store.upsert("A", backup(5.0, 5.0, 50)).await.unwrap();

        let display = arbiter(store, None)
            .display_coordinate("A")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(display.source, DisplaySource::Backup);
        assert_eq!(display.coordinate.timestamp(), at(50));
    }

    #[tokio::test]
    async fn test_sentinel_live_uses_backup() {
        let store = Arc::new(MemoryStore::new());
        store.set_live("A", LiveReading::new(0.0, 0.0, at(100))).await;
        store.upsert("A", backup(5.0, 5.0, 50)).await.unwrap();

        let display = arbiter(store, None).display_coordinate("A").await.unwrap();

        assert_eq!(display.unwrap().source, DisplaySource::Backup);
    }

    #[tokio::test]
    async fn test_nothing_usable_is_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set_live("A", LiveReading::new(91.0, 0.0, at(100))).await;

        assert!(
            arbiter(store, None)
                .display_coordinate("A")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_stale_live_is_treated_as_invalid() {
        let store = Arc::new(MemoryStore::new());
        store.set_live("A", LiveReading::new(10.0, 20.0, at(100))).await;
        store.upsert("A", backup(5.0, 5.0, 50)).await.unwrap();

        let strict = arbiter(store.clone(), Some(Duration::seconds(60)));
        let display = strict.display_coordinate("A").await.unwrap().unwrap();
        assert_eq!(display.source, DisplaySource::Backup);

        let relaxed = arbiter(store, Some(Duration::seconds(600)));
        let display = relaxed.display_coordinate("A").await.unwrap().unwrap();
        assert_eq!(display.source, DisplaySource::Live);
    }

    #[tokio::test]
    async fn test_unreachable_live_source_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.upsert("A", backup(5.0, 5.0, 50)).await.unwrap();

        let arbiter = Arbiter::new(
            store,
            Arc::new(DownLive),
            Arc::new(ManualClock::new(at(200))),
            LivePolicy::default(),
        );

        let display = arbiter.display_coordinate("A").await.unwrap().unwrap();
        assert_eq!(display.source, DisplaySource::Backup);
    }
}
