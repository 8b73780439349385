//! # Storage boundary
//!
//! Three collaborators sit behind traits so the arbitration and sweep logic never
//! touch a database directly:
//!
//! - [`BackupStore`]: last-known-good coordinate per bin, written only with validated,
//!   strictly newer coordinates.
//! - [`LiveSource`]: most recent device report per bin, owned by ingestion.
//! - [`FleetListing`]: every bin id the fleet knows about.
//!
//! The store, not the caller, decides what "newer" means. Two writers racing on the same
//! bin always end with the later timestamp stored, whatever order they land in.
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::coordinate::{Coordinate, LiveReading};

pub const SOURCE_SCHEDULED: &str = "scheduled";
pub const SOURCE_MANUAL: &str = "manual";
pub const SOURCE_MOBILE_DEFAULT: &str = "gps_live";

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupRecord {
    #[serde(flatten)]
    pub coordinate: Coordinate,
    pub source: String,
}

impl BackupRecord {
    pub fn new(coordinate: Coordinate, source: impl Into<String>) -> Self {
        Self {
            coordinate,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpsertOutcome {
    Committed,
    Stale,
}

#[async_trait]
pub trait BackupStore: Send + Sync + 'static {
    async fn get(&self, bin_id: &str) -> Result<Option<BackupRecord>, StoreError>;

    /// Commits `record` only if its timestamp is strictly newer than the stored one.
    async fn upsert(&self, bin_id: &str, record: BackupRecord)
    -> Result<UpsertOutcome, StoreError>;

    /// Every stored backup, ordered by bin id.
    async fn list(&self) -> Result<Vec<(String, BackupRecord)>, StoreError>;
}

#[async_trait]
pub trait LiveSource: Send + Sync + 'static {
    async fn live_reading(&self, bin_id: &str) -> Result<Option<LiveReading>, StoreError>;
}

#[async_trait]
pub trait FleetListing: Send + Sync + 'static {
    async fn list_bin_ids(&self) -> Result<Vec<String>, StoreError>;
}
