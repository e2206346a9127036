use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the run coordinator and the recovery sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Candidates pulled from the source before they are reconciled.
    pub batch_size: usize,
    /// Upper bound on concurrent applies within one run.
    pub apply_concurrency: usize,
    /// Flush counters after this many processed candidates...
    pub flush_every_items: u64,
    /// ...or once this much time passed since the last flush.
    pub flush_interval: Duration,
    /// Runs longer than this are stopped with `reason = "timeout"`.
    pub max_run_duration: Duration,
    /// Consecutive apply failures that abort the run.
    pub max_consecutive_apply_failures: u32,
    /// Per-item errors kept verbatim in run details.
    pub max_error_details: usize,
    /// A running run without a flush for this long is stale.
    pub stale_after: Duration,
    pub resume_from_cursor: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 200,
            apply_concurrency: 4,
            flush_every_items: 100,
            flush_interval: Duration::from_secs(5),
            max_run_duration: Duration::from_secs(60 * 60),
            max_consecutive_apply_failures: 25,
            max_error_details: 50,
            stale_after: Duration::from_secs(15 * 60),
            resume_from_cursor: true,
        }
    }
}

impl EngineConfig {
    /// Read `ASSETOPS_*` overrides on top of the defaults.
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            batch_size: env_parse("ASSETOPS_BATCH_SIZE")?.unwrap_or(d.batch_size),
            apply_concurrency: env_parse("ASSETOPS_APPLY_CONCURRENCY")?
                .unwrap_or(d.apply_concurrency),
            flush_every_items: env_parse("ASSETOPS_FLUSH_EVERY_ITEMS")?
                .unwrap_or(d.flush_every_items),
            flush_interval: env_parse("ASSETOPS_FLUSH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.flush_interval),
            max_run_duration: env_parse("ASSETOPS_MAX_RUN_DURATION_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.max_run_duration),
            max_consecutive_apply_failures: env_parse("ASSETOPS_MAX_CONSECUTIVE_APPLY_FAILURES")?
                .unwrap_or(d.max_consecutive_apply_failures),
            max_error_details: env_parse("ASSETOPS_MAX_ERROR_DETAILS")?
                .unwrap_or(d.max_error_details),
            stale_after: env_parse("ASSETOPS_STALE_AFTER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.stale_after),
            resume_from_cursor: env_parse("ASSETOPS_RESUME_FROM_CURSOR")?
                .unwrap_or(d.resume_from_cursor),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".to_string()));
        }
        if self.apply_concurrency == 0 {
            return Err(Error::InvalidInput(
                "apply_concurrency must be > 0".to_string(),
            ));
        }
        if self.flush_every_items == 0 {
            return Err(Error::InvalidInput(
                "flush_every_items must be > 0".to_string(),
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::InvalidInput(
                "flush_interval must be > 0".to_string(),
            ));
        }
        if self.max_run_duration.is_zero() {
            return Err(Error::InvalidInput(
                "max_run_duration must be > 0".to_string(),
            ));
        }
        if self.max_consecutive_apply_failures == 0 {
            return Err(Error::InvalidInput(
                "max_consecutive_apply_failures must be > 0".to_string(),
            ));
        }
        if self.stale_after.is_zero() {
            return Err(Error::InvalidInput("stale_after must be > 0".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::InvalidInput(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.batch_size, 200);
        assert!(cfg.resume_from_cursor);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let cfg = EngineConfig {
            apply_concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = EngineConfig {
            flush_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
