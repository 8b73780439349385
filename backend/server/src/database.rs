//! # Redis
//!
//! Production backing for the backup store, the live-reading source and the fleet
//! listing.
//!
//! ## Schema
//!
//! - `bins`: set of every bin id the fleet knows about, maintained by ingestion
//! - `bin:{id}:live`: hash `latitude`, `longitude`, `timestamp` (epoch ms), maintained by
//!   ingestion and only ever read here
//! - `bin:{id}:backup`: hash `latitude`, `longitude`, `timestamp` (epoch ms), `source`
//! - `backups`: set of bin ids that have a backup hash
//!
//! ## Monotonic writes
//!
//! The compare-and-set for backups runs as a Lua script so the timestamp check and the
//! write are one atomic step inside Redis. A retried or slow writer can never regress a
//! newer backup, no matter how many API replicas race on the same bin.
use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::warn;

use crate::{
    coordinate::{Coordinate, LiveReading},
    store::{BackupRecord, BackupStore, FleetListing, LiveSource, StoreError, UpsertOutcome},
    utils::parse_timestamp,
};

pub const FLEET_KEY: &str = "bins";
pub const BACKUP_INDEX_KEY: &str = "backups";

pub const LATITUDE: &str = "latitude";
pub const LONGITUDE: &str = "longitude";
pub const TIMESTAMP: &str = "timestamp";
pub const SOURCE: &str = "source";

const UPSERT_BACKUP: &str = r#"
local current = redis.call('HGET', KEYS[1], 'timestamp')
if current and tonumber(current) >= tonumber(ARGV[3]) then
    return 0
end
redis.call('HSET', KEYS[1], 'latitude', ARGV[1], 'longitude', ARGV[2], 'timestamp', ARGV[3], 'source', ARGV[4])
redis.call('SADD', KEYS[2], ARGV[5])
return 1
"#;

pub fn live_key(bin_id: &str) -> String {
    format!("bin:{bin_id}:live")
}

pub fn backup_key(bin_id: &str) -> String {
    format!("bin:{bin_id}:backup")
}

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    upsert_script: Script,
}

impl RedisStore {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            upsert_script: Script::new(UPSERT_BACKUP),
        }
    }

    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(init_redis(redis_url).await?))
    }
}

fn parse_f64(fields: &HashMap<String, String>, name: &str) -> Option<f64> {
    fields.get(name).and_then(|value| value.trim().parse().ok())
}

fn parse_live(fields: &HashMap<String, String>) -> LiveReading {
    LiveReading {
        latitude: parse_f64(fields, LATITUDE),
        longitude: parse_f64(fields, LONGITUDE),
        timestamp: fields.get(TIMESTAMP).and_then(|raw| parse_timestamp(raw)),
    }
}

fn parse_backup(bin_id: &str, fields: &HashMap<String, String>) -> Option<BackupRecord> {
    if fields.is_empty() {
        return None;
    }

    let parsed = parse_f64(fields, LATITUDE)
        .zip(parse_f64(fields, LONGITUDE))
        .zip(fields.get(TIMESTAMP).and_then(|raw| parse_timestamp(raw)));

    let coordinate = parsed
        .and_then(|((lat, lon), timestamp)| Coordinate::new(lat, lon, timestamp).ok());

    match coordinate {
        Some(coordinate) => Some(BackupRecord::new(
            coordinate,
            fields.get(SOURCE).cloned().unwrap_or_default(),
        )),
        None => {
            warn!(bin_id, "Ignoring unreadable backup hash");
            None
        }
    }
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids
}

#[async_trait]
impl BackupStore for RedisStore {
    async fn get(&self, bin_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection.hgetall(backup_key(bin_id)).await?;

        Ok(parse_backup(bin_id, &fields))
    }

    async fn upsert(
        &self,
        bin_id: &str,
        record: BackupRecord,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut connection = self.connection.clone();
        let coordinate = record.coordinate;

        let committed: i32 = self
            .upsert_script
            .key(backup_key(bin_id))
            .key(BACKUP_INDEX_KEY)
            .arg(coordinate.latitude())
            .arg(coordinate.longitude())
            .arg(coordinate.timestamp().timestamp_millis())
            .arg(&record.source)
            .arg(bin_id)
            .invoke_async(&mut connection)
            .await?;

        Ok(if committed == 1 {
            UpsertOutcome::Committed
        } else {
            UpsertOutcome::Stale
        })
    }

    async fn list(&self) -> Result<Vec<(String, BackupRecord)>, StoreError> {
        let mut connection = self.connection.clone();
        let ids = sorted(connection.smembers(BACKUP_INDEX_KEY).await?);

        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(backup_key(id));
        }

        let rows: Vec<HashMap<String, String>> = pipe.query_async(&mut connection).await?;

        Ok(ids
            .into_iter()
            .zip(rows)
            .filter_map(|(id, fields)| parse_backup(&id, &fields).map(|record| (id, record)))
            .collect())
    }
}

#[async_trait]
impl LiveSource for RedisStore {
    async fn live_reading(&self, bin_id: &str) -> Result<Option<LiveReading>, StoreError> {
        let mut connection = self.connection.clone();
        let fields: HashMap<String, String> = connection.hgetall(live_key(bin_id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(parse_live(&fields)))
    }
}

#[async_trait]
impl FleetListing for RedisStore {
    async fn list_bin_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();

        Ok(sorted(connection.smembers(FLEET_KEY).await?))
    }
}

/// Field values ingestion writes for a live reading.
pub fn live_fields(
    latitude: f64,
    longitude: f64,
    timestamp_ms: i64,
) -> [(&'static str, String); 3] {
    [
        (LATITUDE, latitude.to_string()),
        (LONGITUDE, longitude.to_string()),
        (TIMESTAMP, timestamp_ms.to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_keys() {
        assert_eq!(live_key("B-7"), "bin:B-7:live");
        assert_eq!(backup_key("B-7"), "bin:B-7:backup");
    }

    #[test]
    fn test_parse_live_keeps_missing_fields_absent() {
        let reading = parse_live(&fields(&[(LATITUDE, "14.5"), (TIMESTAMP, "1000")]));

        assert_eq!(reading.latitude, Some(14.5));
        assert_eq!(reading.longitude, None);
        assert_eq!(reading.timestamp, Utc.timestamp_millis_opt(1000).single());
        assert!(!reading.is_valid());
    }

    #[test]
    fn test_parse_live_garbage_is_invalid_not_error() {
        let reading = parse_live(&fields(&[(LATITUDE, "n/a"), (LONGITUDE, "120.1")]));

        assert_eq!(reading.latitude, None);
        assert!(!reading.is_valid());
    }

    #[test]
    fn test_parse_backup() {
        let record = parse_backup(
            "A",
            &fields(&[
                (LATITUDE, "14.5"),
                (LONGITUDE, "121.0"),
                (TIMESTAMP, "5000"),
                (SOURCE, "manual"),
            ]),
        )
        .unwrap();

        assert_eq!(record.coordinate.latitude(), 14.5);
        assert_eq!(record.coordinate.timestamp().timestamp_millis(), 5000);
        assert_eq!(record.source, "manual");

        assert!(parse_backup("A", &HashMap::new()).is_none());
        assert!(
            parse_backup(
                "A",
                &fields(&[(LATITUDE, "0"), (LONGITUDE, "0"), (TIMESTAMP, "5000")])
            )
            .is_none()
        );
    }

    /// Needs a Redis at `REDIS_URL` (default `redis://localhost:6379`).
    #[tokio::test]
    #[ignore]
    async fn test_redis_upsert_is_monotonic() {
        let url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store = RedisStore::connect(&url).await.unwrap();
        let bin_id = format!("test-{}", Utc::now().timestamp_nanos_opt().unwrap());

        let record = |millis: i64| {
            let timestamp = Utc.timestamp_millis_opt(millis).unwrap();
            BackupRecord::new(Coordinate::new(14.5, 121.0, timestamp).unwrap(), "scheduled")
        };

        assert_eq!(
            store.upsert(&bin_id, record(2_000)).await.unwrap(),
            UpsertOutcome::Committed
        );
        assert_eq!(
            store.upsert(&bin_id, record(2_000)).await.unwrap(),
            UpsertOutcome::Stale
        );
        assert_eq!(
            store.upsert(&bin_id, record(1_000)).await.unwrap(),
            UpsertOutcome::Stale
        );
        assert_eq!(
            store.upsert(&bin_id, record(3_000)).await.unwrap(),
            UpsertOutcome::Committed
        );

        let stored = store.get(&bin_id).await.unwrap().unwrap();
        assert_eq!(stored.coordinate.timestamp().timestamp_millis(), 3_000);
        assert!(store.list().await.unwrap().iter().any(|(id, _)| *id == bin_id));

        let mut connection = store.connection.clone();
        let _: () = connection.del(backup_key(&bin_id)).await.unwrap();
        let _: () = connection.srem(BACKUP_INDEX_KEY, &bin_id).await.unwrap();
    }

    #[test]
    fn test_live_fields() {
        let [lat, lon, ts] = live_fields(14.5, 121.0, 42);

        assert_eq!(lat, (LATITUDE, "14.5".to_string()));
        assert_eq!(lon, (LONGITUDE, "121".to_string()));
        assert_eq!(ts, (TIMESTAMP, "42".to_string()));
    }
}
