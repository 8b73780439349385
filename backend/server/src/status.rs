//! Read-side views over live readings and backups. Nothing here writes.
//!
//! An unreachable live source reads as "no live reading", the same as on the display
//! path; only a backup store failure fails the request.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{
    arbitration::{DisplaySource, decide, display_source},
    clock::Clock,
    coordinate::{LivePolicy, LiveReading},
    store::{BackupRecord, BackupStore, FleetListing, LiveSource, StoreError},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveStatus {
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupStatus {
    pub valid: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinStatus {
    pub bin_id: String,
    pub live: LiveStatus,
    pub backup: BackupStatus,
    pub display_source: DisplaySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Valid live reading inside the freshness window.
    Online,
    /// Valid live reading that has aged out.
    Stale,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicStatus {
    #[serde(flatten)]
    pub status: BinStatus,
    pub live_age_secs: Option<i64>,
    pub fresh: bool,
    pub connectivity: Connectivity,
}

#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn BackupStore>,
    live: Arc<dyn LiveSource>,
    fleet: Arc<dyn FleetListing>,
    clock: Arc<dyn Clock>,
    policy: LivePolicy,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn BackupStore>,
        live: Arc<dyn LiveSource>,
        fleet: Arc<dyn FleetListing>,
        clock: Arc<dyn Clock>,
        policy: LivePolicy,
    ) -> Self {
        Self {
            store,
            live,
            fleet,
            clock,
            policy,
        }
    }

    async fn read(
        &self,
        bin_id: &str,
    ) -> Result<(Option<LiveReading>, Option<BackupRecord>), StoreError> {
        let (live, backup) = tokio::join!(self.live.live_reading(bin_id), self.store.get(bin_id));

        let live = live.unwrap_or_else(|e| {
            warn!(bin_id, error = %e, "Live source unreachable, reporting no live reading");
            None
        });

        Ok((live, backup?))
    }

    fn compose(
        &self,
        bin_id: &str,
        live: Option<&LiveReading>,
        backup: Option<&BackupRecord>,
        now: DateTime<Utc>,
    ) -> BinStatus {
        let usable = live.and_then(|reading| self.policy.usable(reading, now));
        let decision = decide(usable, backup);

        BinStatus {
            bin_id: bin_id.to_string(),
            live: LiveStatus {
                valid: live.is_some_and(LiveReading::is_valid),
                latitude: live.and_then(|r| r.latitude),
                longitude: live.and_then(|r| r.longitude),
                timestamp: live.and_then(|r| r.timestamp),
            },
            backup: BackupStatus {
                valid: backup.is_some(),
                latitude: backup.map(|b| b.coordinate.latitude()),
                longitude: backup.map(|b| b.coordinate.longitude()),
                timestamp: backup.map(|b| b.coordinate.timestamp()),
                source: backup.map(|b| b.source.clone()),
            },
            display_source: display_source(decision.as_ref()),
        }
    }

    pub async fn bin_status(&self, bin_id: &str) -> Result<BinStatus, StoreError> {
        let (live, backup) = self.read(bin_id).await?;

        Ok(self.compose(bin_id, live.as_ref(), backup.as_ref(), self.clock.now()))
    }

    pub async fn fleet_status(&self) -> Result<Vec<BinStatus>, StoreError> {
        let mut statuses = Vec::new();

        for bin_id in self.fleet.list_bin_ids().await? {
            statuses.push(self.bin_status(&bin_id).await?);
        }

        Ok(statuses)
    }

    /// `None` when the bin has neither a live reading nor a backup.
    pub async fn dynamic_bin_status(
        &self,
        bin_id: &str,
    ) -> Result<Option<DynamicStatus>, StoreError> {
        let (live, backup) = self.read(bin_id).await?;

        if live.is_none() && backup.is_none() {
            return Ok(None);
        }

        let now = self.clock.now();
        let status = self.compose(bin_id, live.as_ref(), backup.as_ref(), now);

        let fresh = live
            .as_ref()
            .is_some_and(|reading| self.policy.is_fresh(reading, now));

        let connectivity = match (status.live.valid, fresh) {
            (true, true) => Connectivity::Online,
            (true, false) => Connectivity::Stale,
            (false, _) => Connectivity::Offline,
        };

        Ok(Some(DynamicStatus {
            status,
            live_age_secs: live
                .and_then(|reading| reading.age(now))
                .map(|age| age.num_seconds()),
            fresh,
            connectivity,
        }))
    }

    pub async fn dynamic_fleet_status(&self) -> Result<Vec<DynamicStatus>, StoreError> {
        let mut statuses = Vec::new();

        for bin_id in self.fleet.list_bin_ids().await? {
            if let Some(status) = self.dynamic_bin_status(&bin_id).await? {
                statuses.push(status);
            }
        }

        Ok(statuses)
    }
}
