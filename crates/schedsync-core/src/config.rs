//! Config - 環境変数（と .env）からの設定
//!
//! 必須は `SCHEDSYNC_TARGET_URL` と、スタジオ一覧（`SCHEDSYNC_LOCATIONS` か
//! `SCHEDSYNC_LOCATIONS_FILE` のどちらか）だけ。残りは全部デフォルトあり。

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::app::{CoordinatorSettings, DriverSettings, site_offset};
use crate::domain::RetryPolicy;
use crate::scrape::{ExtractionConfig, SelectorSet, StageTimeouts};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}='{value}' is not valid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationSource {
    /// `code:name,code:name`
    Inline(String),
    JsonFile(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub target_url: String,
    pub locations: LocationSource,
    pub horizon_days: u32,
    pub utc_offset_hours: i32,
    pub budget: Duration,
    pub stale_after: Duration,
    pub task_ttl_days: u32,
    pub nav_timeout: Duration,
    pub render_timeout: Duration,
    pub scrape_attempts: u32,
    pub selectors: SelectorSet,
}

impl Config {
    /// Load configuration from the process environment (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env は無くてもよい（本番は実環境変数）
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let locations = match (get("SCHEDSYNC_LOCATIONS"), get("SCHEDSYNC_LOCATIONS_FILE")) {
            (Some(inline), _) => LocationSource::Inline(inline),
            (None, Some(path)) => LocationSource::JsonFile(PathBuf::from(path)),
            (None, None) => return Err(ConfigError::Missing("SCHEDSYNC_LOCATIONS")),
        };

        let defaults = SelectorSet::default();
        let selector = |key: &str, default: String| get(key).unwrap_or(default);

        Ok(Self {
            db_path: get("SCHEDSYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("schedsync.db")),
            target_url: get("SCHEDSYNC_TARGET_URL")
                .ok_or(ConfigError::Missing("SCHEDSYNC_TARGET_URL"))?,
            locations,
            horizon_days: parse_or(&get, "SCHEDSYNC_HORIZON_DAYS", 7)?,
            utc_offset_hours: parse_or(&get, "SCHEDSYNC_UTC_OFFSET_HOURS", 9)?,
            budget: secs_or(&get, "SCHEDSYNC_BUDGET_SECS", 840)?,
            stale_after: secs_or(&get, "SCHEDSYNC_STALE_AFTER_SECS", 900)?,
            task_ttl_days: parse_or(&get, "SCHEDSYNC_TASK_TTL_DAYS", 7)?,
            nav_timeout: secs_or(&get, "SCHEDSYNC_NAV_TIMEOUT_SECS", 30)?,
            render_timeout: secs_or(&get, "SCHEDSYNC_RENDER_TIMEOUT_SECS", 20)?,
            scrape_attempts: parse_or(&get, "SCHEDSYNC_SCRAPE_ATTEMPTS", 3)?,
            selectors: SelectorSet {
                container: selector("SCHEDSYNC_SEL_CONTAINER", defaults.container.clone()),
                slot: selector("SCHEDSYNC_SEL_SLOT", defaults.slot.clone()),
                time: selector("SCHEDSYNC_SEL_TIME", defaults.time.clone()),
                program: selector("SCHEDSYNC_SEL_PROGRAM", defaults.program.clone()),
                instructor: selector("SCHEDSYNC_SEL_INSTRUCTOR", defaults.instructor.clone()),
                status: selector("SCHEDSYNC_SEL_STATUS", defaults.status.clone()),
                available_attr: selector("SCHEDSYNC_SEL_AVAILABLE_ATTR", defaults.available_attr.clone()),
                full_class: selector("SCHEDSYNC_SEL_FULL_CLASS", defaults.full_class.clone()),
            },
        })
    }

    pub fn extraction(&self) -> ExtractionConfig {
        ExtractionConfig {
            url_template: self.target_url.clone(),
            selectors: self.selectors.clone(),
            timeouts: StageTimeouts {
                launch: self.nav_timeout,
                navigate: self.nav_timeout,
                render: self.render_timeout,
                ..StageTimeouts::default()
            },
            retry: RetryPolicy {
                max_attempts: self.scrape_attempts.max(1),
                ..RetryPolicy::scrape_default()
            },
        }
    }

    pub fn coordinator(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            site_offset: site_offset(self.utc_offset_hours),
            task_ttl: chrono::Duration::days(i64::from(self.task_ttl_days)),
            store_retry: RetryPolicy::store_default(),
        }
    }

    pub fn driver(&self) -> DriverSettings {
        DriverSettings {
            budget: self.budget,
            stale_after: chrono::Duration::from_std(self.stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(15)),
            ..DriverSettings::default()
        }
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs_or<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[
            ("SCHEDSYNC_TARGET_URL", "https://studio.test/{location}/{date}"),
            ("SCHEDSYNC_LOCATIONS", "ginza:銀座"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("schedsync.db"));
        assert_eq!(config.horizon_days, 7);
        assert_eq!(config.utc_offset_hours, 9);
        assert_eq!(config.budget, Duration::from_secs(840));
        assert_eq!(config.stale_after, Duration::from_secs(900));
        assert_eq!(config.selectors, SelectorSet::default());
        assert_eq!(config.locations, LocationSource::Inline("ginza:銀座".to_string()));

        assert_eq!(config.driver().stale_after, chrono::Duration::minutes(15));
        assert_eq!(config.extraction().retry.max_attempts, 3);
        assert_eq!(config.coordinator().task_ttl, chrono::Duration::days(7));
    }

    #[test]
    fn overrides_and_location_file() {
        let config = Config::from_lookup(lookup(&[
            ("SCHEDSYNC_TARGET_URL", "https://x/{location}"),
            ("SCHEDSYNC_LOCATIONS_FILE", "/etc/schedsync/studios.json"),
            ("SCHEDSYNC_HORIZON_DAYS", "14"),
            ("SCHEDSYNC_UTC_OFFSET_HOURS", "-5"),
            ("SCHEDSYNC_SEL_SLOT", "li.class-slot"),
        ]))
        .unwrap();

        assert_eq!(config.horizon_days, 14);
        assert_eq!(config.utc_offset_hours, -5);
        assert_eq!(config.selectors.slot, "li.class-slot");
        assert_eq!(
            config.locations,
            LocationSource::JsonFile(PathBuf::from("/etc/schedsync/studios.json"))
        );
    }

    #[test]
    fn missing_and_invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&[("SCHEDSYNC_LOCATIONS", "ginza")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SCHEDSYNC_TARGET_URL")));

        let err = Config::from_lookup(lookup(&[("SCHEDSYNC_TARGET_URL", "https://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("SCHEDSYNC_LOCATIONS")));

        let err = Config::from_lookup(lookup(&[
            ("SCHEDSYNC_TARGET_URL", "https://x"),
            ("SCHEDSYNC_LOCATIONS", "ginza"),
            ("SCHEDSYNC_BUDGET_SECS", "fourteen minutes"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SCHEDSYNC_BUDGET_SECS"), "{err}");
    }
}
