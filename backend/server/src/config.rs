use std::{env, fmt::Display, str::FromStr, time::Duration};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    coordinate::{DEFAULT_MAX_CLOCK_SKEW_SECS, LivePolicy},
    scheduler::SweepConfig,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub backup_interval: Duration,
    pub sweep_concurrency: usize,
    /// Zero disables the timeout.
    pub sweep_timeout: Duration,
    /// Zero disables the freshness window.
    pub live_freshness: Duration,
    /// Zero allows no timestamps ahead of the server clock.
    pub max_clock_skew: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1111,
            store_backend: StoreBackend::Redis,
            redis_url: "redis://redis:6379".to_string(),
            backup_interval: Duration::from_secs(60 * 60),
            sweep_concurrency: 8,
            sweep_timeout: Duration::from_secs(5 * 60),
            live_freshness: Duration::ZERO,
            max_clock_skew: Duration::from_secs(DEFAULT_MAX_CLOCK_SKEW_SECS as u64),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self {
            port: try_load("RUST_PORT", "1111")?,
            store_backend: try_load("STORE_BACKEND", "redis")?,
            redis_url: try_load("REDIS_URL", "redis://redis:6379")?,
            backup_interval: Duration::from_secs(try_load("BACKUP_INTERVAL_SECS", "3600")?),
            sweep_concurrency: try_load("SWEEP_CONCURRENCY", "8")?,
            sweep_timeout: Duration::from_secs(try_load("SWEEP_TIMEOUT_SECS", "300")?),
            live_freshness: Duration::from_secs(try_load("LIVE_FRESHNESS_SECS", "0")?),
            max_clock_skew: Duration::from_secs(try_load("MAX_CLOCK_SKEW_SECS", "300")?),
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "BACKUP_INTERVAL_SECS",
                reason: "must be at least 1".to_string(),
            });
        }

        if self.sweep_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "SWEEP_CONCURRENCY",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn live_policy(&self) -> LivePolicy {
        let freshness = (!self.live_freshness.is_zero())
            .then(|| chrono::Duration::from_std(self.live_freshness).ok())
            .flatten();

        let max_skew = chrono::Duration::from_std(self.max_clock_skew)
            .unwrap_or(chrono::Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS));

        LivePolicy::new(freshness).with_max_skew(max_skew)
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: self.backup_interval,
            concurrency: self.sweep_concurrency,
            timeout: (!self.sweep_timeout.is_zero()).then_some(self.sweep_timeout),
            policy: self.live_policy(),
        }
    }
}

fn var(key: &str) -> Result<String, ()> {
    env::var(key).map_err(|_| {
        info!("Environment variable {key} not found, using default");
    })
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    var(key)
        .unwrap_or_else(|_| {
            info!("{key} not set, using default: {default}");
            default.to_string()
        })
        .parse()
        .map_err(|e: T::Err| {
            warn!("Invalid {key} value: {e}");

            ConfigError::Invalid {
                key,
                reason: e.to_string(),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_parse() {
        assert_eq!("redis".parse(), Ok(StoreBackend::Redis));
        assert_eq!(" Memory ".parse(), Ok(StoreBackend::Memory));
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_zero_disables_timeout_and_freshness() {
        let config = Config {
            sweep_timeout: Duration::ZERO,
            ..Config::default()
        };

        let sweep = config.sweep_config();
        assert_eq!(sweep.timeout, None);
        assert_eq!(sweep.policy.freshness, None);
        assert_eq!(sweep.interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_freshness_window() {
        let config = Config {
            live_freshness: Duration::from_secs(90),
            ..Config::default()
        };

        assert_eq!(
            config.live_policy().freshness,
            Some(chrono::Duration::seconds(90))
        );
    }

    #[test]
    fn test_clock_skew_allowance() {
        assert_eq!(
            Config::default().live_policy().max_skew,
            chrono::Duration::minutes(5)
        );

        let strict = Config {
            max_clock_skew: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(strict.live_policy().max_skew, chrono::Duration::zero());
    }

    #[test]
    fn test_validate() {
        let config = Config {
            sweep_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
