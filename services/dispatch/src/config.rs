//! Service configuration, loaded from the environment.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;

use crate::ratelimit::RateLimitConfig;
use crate::service::ServiceConfig;
use crate::store::DbConfig;

/// Top-level daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log filter, e.g. "info" or "rounds_dispatch=debug".
    pub log_level: String,

    pub database: DbConfig,

    /// Interval between scheduled allocation passes.
    pub scheduler_interval: Duration,

    /// Page size for pending-order queue reads.
    pub queue_page_size: i64,

    pub rate_limit: RateLimitConfig,

    /// Dev mode runs migrations on startup.
    pub dev_mode: bool,
}

impl Config {
    /// Load configuration from environment variables. Unset variables
    /// fall back to defaults; set-but-unparsable ones are errors.
    pub fn from_env() -> Result<Self> {
        let mut rate_limit = RateLimitConfig::default();
        if let Some(secs) = parse_env::<i64>("ROUNDS_RATE_WINDOW_SECS")? {
            rate_limit.window = ChronoDuration::seconds(secs);
        }
        if let Some(ceiling) = parse_env::<i64>("ROUNDS_RATE_CEILING")? {
            rate_limit.ceiling = ceiling;
        }
        if let Some(hours) = parse_env::<i64>("ROUNDS_RATE_RETENTION_HOURS")? {
            rate_limit.retention = ChronoDuration::hours(hours);
        }
        if let Some(secs) = parse_env::<u64>("ROUNDS_SWEEP_INTERVAL_SECS")? {
            rate_limit.sweep_interval = Duration::from_secs(secs);
        }

        Ok(Self {
            log_level: std::env::var("ROUNDS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            database: DbConfig::from_env(),
            scheduler_interval: Duration::from_secs(
                parse_env::<u64>("ROUNDS_SCHEDULER_INTERVAL_SECS")?.unwrap_or(3600),
            ),
            queue_page_size: parse_env::<i64>("ROUNDS_QUEUE_PAGE_SIZE")?
                .unwrap_or(crate::queue::DEFAULT_PAGE_SIZE),
            rate_limit,
            dev_mode: std::env::var("ROUNDS_DEV").map(|v| v == "1" || v == "true").unwrap_or(false),
        })
    }

    /// The tunables forwarded to [`crate::service::DispatchService`].
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            rate_limit: self.rate_limit.clone(),
            queue_page_size: self.queue_page_size,
            scheduler_interval: self.scheduler_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database: DbConfig::default(),
            scheduler_interval: Duration::from_secs(3600),
            queue_page_size: crate::queue::DEFAULT_PAGE_SIZE,
            rate_limit: RateLimitConfig::default(),
            dev_mode: false,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("invalid value for {name}: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
