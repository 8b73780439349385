//! # Coordinates
//!
//! Bins report `(latitude, longitude, timestamp)` triples. The all-zero pair is what a
//! tracker sends when it has no fix, so it is never treated as a real location.
//!
//! A [`Coordinate`] can only be built through [`Coordinate::new`], which means anything
//! holding one has already passed validation. Raw device data lives in [`LiveReading`]
//! until it is checked.
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;
use thiserror::Error;

pub const MIN_LATITUDE: f64 = -90.0;
pub const MAX_LATITUDE: f64 = 90.0;
pub const MIN_LONGITUDE: f64 = -180.0;
pub const MAX_LONGITUDE: f64 = 180.0;

/// How far ahead of the server clock a reported timestamp may be.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
#[error("Invalid coordinates: ({latitude:?}, {longitude:?})")]
pub struct InvalidCoordinate {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Plausible, non-sentinel Earth coordinate check.
pub fn is_valid(latitude: Option<f64>, longitude: Option<f64>) -> bool {
    let (Some(lat), Some(lon)) = (latitude, longitude) else {
        return false;
    };

    if !lat.is_finite() || !lon.is_finite() {
        return false;
    }

    if !(MIN_LATITUDE..=MAX_LATITUDE).contains(&lat)
        || !(MIN_LONGITUDE..=MAX_LONGITUDE).contains(&lon)
    {
        return false;
    }

    !(lat == 0.0 && lon == 0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
    timestamp: DateTime<Utc>,
}

impl Coordinate {
    /// Timestamps are kept at millisecond precision, the resolution backups are stored at.
    pub fn new(
        latitude: f64,
        longitude: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<Self, InvalidCoordinate> {
        if !is_valid(Some(latitude), Some(longitude)) {
            return Err(InvalidCoordinate {
                latitude: Some(latitude),
                longitude: Some(longitude),
            });
        }

        Ok(Self {
            latitude,
            longitude,
            timestamp: timestamp.trunc_subsecs(3),
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Most recent device report, exactly as ingestion stored it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveReading {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LiveReading {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            timestamp: Some(timestamp),
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid(self.latitude, self.longitude)
    }

    /// Validated coordinate, if the reading has a fix and a timestamp.
    pub fn coordinate(&self) -> Option<Coordinate> {
        let (Some(lat), Some(lon), Some(timestamp)) =
            (self.latitude, self.longitude, self.timestamp)
        else {
            return None;
        };

        Coordinate::new(lat, lon, timestamp).ok()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.timestamp.map(|timestamp| now - timestamp)
    }
}

/// Decides whether a live reading may be shown or backed up.
///
/// Without a freshness window any valid reading is usable. With one, a reading older
/// than the window is treated exactly like an invalid one. A reading stamped further
/// ahead of the server clock than `max_skew` is never usable.
#[derive(Debug, Clone, Copy)]
pub struct LivePolicy {
    pub freshness: Option<Duration>,
    pub max_skew: Duration,
}

impl Default for LivePolicy {
    fn default() -> Self {
        Self::new(None)
    }
}

impl LivePolicy {
    pub fn new(freshness: Option<Duration>) -> Self {
        Self {
            freshness,
            max_skew: Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
        }
    }

    pub fn with_max_skew(self, max_skew: Duration) -> Self {
        Self { max_skew, ..self }
    }

    /// A timestamp further in the future than the skew allowance would pin the backup.
    pub fn is_from_future(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        timestamp > now + self.max_skew
    }

    pub fn is_fresh(&self, reading: &LiveReading, now: DateTime<Utc>) -> bool {
        match (self.freshness, reading.age(now)) {
            (None, _) => true,
            (Some(window), Some(age)) => age <= window,
            (Some(_), None) => false,
        }
    }

    pub fn usable(&self, reading: &LiveReading, now: DateTime<Utc>) -> Option<Coordinate> {
        let coordinate = reading.coordinate()?;

        if self.is_from_future(coordinate.timestamp(), now) {
            return None;
        }

        self.is_fresh(reading, now).then_some(coordinate)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_in_range() {
        assert!(is_valid(Some(10.0), Some(20.0)));
        assert!(is_valid(Some(-90.0), Some(-180.0)));
        assert!(is_valid(Some(90.0), Some(180.0)));
        assert!(is_valid(Some(0.0), Some(12.5)));
        assert!(is_valid(Some(-33.9), Some(0.0)));
    }

    #[test]
    fn test_sentinel_zero() {
        assert!(!is_valid(Some(0.0), Some(0.0)));
        assert!(!is_valid(Some(-0.0), Some(0.0)));
    }

    #[test]
    fn test_out_of_range() {
        assert!(!is_valid(Some(91.0), Some(0.0)));
        assert!(!is_valid(Some(-90.5), Some(10.0)));
        assert!(!is_valid(Some(10.0), Some(180.1)));
        assert!(!is_valid(Some(10.0), Some(-181.0)));
    }

    #[test]
    fn test_missing_or_not_finite() {
        assert!(!is_valid(Some(f64::NAN), Some(0.0)));
        assert!(!is_valid(Some(10.0), Some(f64::INFINITY)));
        assert!(!is_valid(None, Some(10.0)));
        assert!(!is_valid(Some(10.0), None));
        assert!(!is_valid(None, None));
    }

    #[test]
    fn test_coordinate_new_rejects_invalid() {
        let err = Coordinate::new(0.0, 0.0, at(1)).unwrap_err();
        assert_eq!(err.latitude, Some(0.0));

        let coordinate = Coordinate::new(14.6, 121.0, at(1)).unwrap();
        assert_eq!(coordinate.latitude(), 14.6);
        assert_eq!(coordinate.longitude(), 121.0);
        assert_eq!(coordinate.timestamp(), at(1));
    }

    #[test]
    fn test_reading_without_timestamp_is_unusable() {
        let reading = LiveReading {
            latitude: Some(10.0),
            longitude: Some(20.0),
            timestamp: None,
        };

        assert!(reading.is_valid());
        assert!(reading.coordinate().is_none());
        assert!(LivePolicy::default().usable(&reading, at(0)).is_none());
    }

    #[test]
    fn test_freshness_window() {
        let policy = LivePolicy::new(Some(Duration::seconds(60)));
        let reading = LiveReading::new(10.0, 20.0, at(1_000));

        assert!(policy.usable(&reading, at(1_060)).is_some());
        assert!(policy.usable(&reading, at(1_061)).is_none());
        assert!(LivePolicy::default().usable(&reading, at(99_999)).is_some());
    }

    #[test]
    fn test_future_reading_is_unusable() {
        let policy = LivePolicy::default().with_max_skew(Duration::seconds(30));

        let ahead = LiveReading::new(10.0, 20.0, at(1_030));
        assert!(policy.usable(&ahead, at(1_000)).is_some());

        let far_ahead = LiveReading::new(10.0, 20.0, at(1_031));
        assert!(policy.usable(&far_ahead, at(1_000)).is_none());
        assert!(policy.is_from_future(at(1_031), at(1_000)));
    }

    #[test]
    fn test_timestamp_truncated_to_millis() {
        let base = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let jittered = base + Duration::nanoseconds(456_789);

        let coordinate = Coordinate::new(10.0, 20.0, jittered).unwrap();
        assert_eq!(coordinate.timestamp(), base);
        assert_eq!(coordinate, Coordinate::new(10.0, 20.0, base).unwrap());
    }
}
