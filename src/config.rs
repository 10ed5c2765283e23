//! Process configuration from `WMS_SYNC_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `WMS_SYNC_BIND` | `0.0.0.0:3000` |
//! | `WMS_SYNC_STATE_DIR` | `./state` |
//! | `WMS_SYNC_WEBHOOK_SECRET` | required |
//! | `WMS_SYNC_INITIAL_SYNC_COMPLETED` | `false` (automation paused) |
//! | `WMS_SYNC_BATCH_SIZE` | `20` |
//! | `WMS_SYNC_INTERVAL_SECS` | `60` |
//! | `WMS_SYNC_MAX_ATTEMPTS` | `3` |
//! | `WMS_SYNC_BACKOFF_SECS` | `30,120,300,900,3600` |
//! | `WMS_SYNC_DEFERRED_TIMEOUT_HOURS` | `24` |
//! | `WMS_SYNC_RETENTION_COMPLETED_DAYS` | `7` |
//! | `WMS_SYNC_RETENTION_FAILED_DAYS` | `30` |
//! | `WMS_SYNC_DEDUPE_TTL_DAYS` | `30` |
//! | `WMS_SYNC_COMPACT_THRESHOLD_BYTES` | `8388608` |
//! | `WMS_SYNC_POLL_<CATEGORY>_MINS` | per category, see [`PollConfig`] |
//! | `WMS_SYNC_POLL_WINDOW_HOURS` | `24` |
//! | `WMS_SYNC_POLL_OVERLAP_MINS` | `10` |
//! | `WMS_SYNC_WMS_BASE_URL` | unset (reconciliation disabled) |
//! | `WMS_SYNC_WMS_TOKEN` | empty |
//! | `WMS_SYNC_WMS_TIMEOUT_SECS` | `30` |
//!
//! Unset variables take their default; set but unparsable or out-of-range
//! ones are errors. Spans must be positive (overlap may be zero) and at most
//! ten years.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::{BackoffSchedule, RetryPolicy};
use crate::store::{Retention, StoreOptions};
use crate::types::EventGroup;
use crate::worker::{AutomationGate, PollConfig, SchedulerConfig};

const PREFIX: &str = "WMS_SYNC_";

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
/// Upper bound for any configured interval, delay, or retention (ten years).
const MAX_SPAN_SECS: u64 = 3650 * DAY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(String),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Connection details for the WMS change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct WmsConfig {
    pub base_url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub state_dir: PathBuf,
    pub webhook_secret: Vec<u8>,
    pub gate: AutomationGate,
    pub scheduler: SchedulerConfig,
    pub retry: RetryPolicy,
    pub store: StoreOptions,
    pub poll: PollConfig,
    /// `None` disables reconciliation.
    pub wms: Option<WmsConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars { lookup };

        let webhook_secret = vars
            .string("WEBHOOK_SECRET")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Missing(format!("{PREFIX}WEBHOOK_SECRET")))?
            .into_bytes();

        let max_attempts: u32 = vars.parse_or("MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(vars.invalid("MAX_ATTEMPTS", "0", "must be at least 1"));
        }
        let backoff = match vars.string("BACKOFF_SECS") {
            Some(raw) => BackoffSchedule::new(
                raw.split(',')
                    .map(|part| {
                        let secs = part
                            .trim()
                            .parse::<u64>()
                            .map_err(|e| vars.invalid("BACKOFF_SECS", &raw, &e.to_string()))?;
                        if secs > MAX_SPAN_SECS {
                            return Err(vars.invalid("BACKOFF_SECS", &raw, "delay too large"));
                        }
                        Ok(Duration::from_secs(secs))
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => BackoffSchedule::default(),
        };

        let batch_size: usize = vars.parse_or("BATCH_SIZE", 20)?;
        if batch_size == 0 {
            return Err(vars.invalid("BATCH_SIZE", "0", "must be at least 1"));
        }
        let scheduler = SchedulerConfig {
            batch_size,
            interval: vars.span("INTERVAL_SECS", 60, 1, 1)?,
            deferred_timeout: vars.chrono_span("DEFERRED_TIMEOUT_HOURS", 24, HOUR)?,
            retention: Retention {
                completed: vars.chrono_span("RETENTION_COMPLETED_DAYS", 7, DAY)?,
                failed: vars.chrono_span("RETENTION_FAILED_DAYS", 30, DAY)?,
                dedupe_ttl: vars.chrono_span("DEDUPE_TTL_DAYS", 30, DAY)?,
            },
        };

        let mut poll = PollConfig::default();
        for group in EventGroup::ALL {
            let name = format!("POLL_{}_MINS", group.as_str().to_uppercase());
            if vars.string(&name).is_some() {
                poll.intervals.insert(group, vars.span(&name, 0, MINUTE, 1)?);
            }
        }
        poll.window = vars.span("POLL_WINDOW_HOURS", poll.window.as_secs() / HOUR, HOUR, 1)?;
        poll.overlap = vars.span("POLL_OVERLAP_MINS", poll.overlap.as_secs() / MINUTE, MINUTE, 0)?;

        let compact_threshold_bytes: u64 = vars.parse_or(
            "COMPACT_THRESHOLD_BYTES",
            StoreOptions::default().compact_threshold_bytes,
        )?;
        if compact_threshold_bytes == 0 {
            return Err(vars.invalid("COMPACT_THRESHOLD_BYTES", "0", "must be at least 1"));
        }

        let wms = match vars.string("WMS_BASE_URL").filter(|s| !s.is_empty()) {
            Some(base_url) => Some(WmsConfig {
                base_url,
                token: vars.string("WMS_TOKEN").unwrap_or_default(),
                timeout: vars.span("WMS_TIMEOUT_SECS", 30, 1, 1)?,
            }),
            None => None,
        };

        Ok(Config {
            bind: vars.parse_or("BIND", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            state_dir: vars
                .string("STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            webhook_secret,
            gate: AutomationGate::from_enabled(vars.parse_or("INITIAL_SYNC_COMPLETED", false)?),
            scheduler,
            retry: RetryPolicy {
                max_attempts,
                backoff,
            },
            store: StoreOptions {
                compact_threshold_bytes,
            },
            poll,
            wms,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| self.invalid(name, &raw, &e.to_string())),
            None => Ok(None),
        }
    }

    fn parse_or<T>(&self, name: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.parse(name)?.unwrap_or(default))
    }

    /// Parses a count of `unit_secs` units, defaulting to `default` units.
    /// Values below `min` or beyond ten years are rejected.
    fn span(&self, name: &str, default: u64, unit_secs: u64, min: u64) -> Result<Duration> {
        let count: u64 = self.parse_or(name, default)?;
        let raw = || count.to_string();
        if count < min {
            return Err(self.invalid(name, &raw(), &format!("must be at least {min}")));
        }
        match count.checked_mul(unit_secs) {
            Some(secs) if secs <= MAX_SPAN_SECS => Ok(Duration::from_secs(secs)),
            _ => Err(self.invalid(name, &raw(), "too large")),
        }
    }

    fn chrono_span(&self, name: &str, default: u64, unit_secs: u64) -> Result<chrono::Duration> {
        let span = self.span(name, default, unit_secs, 1)?;
        chrono::Duration::from_std(span)
            .map_err(|e| self.invalid(name, &span.as_secs().to_string(), &e.to_string()))
    }

    fn invalid(&self, name: &str, value: &str, reason: &str) -> ConfigError {
        ConfigError::Invalid {
            name: format!("{PREFIX}{name}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_with_only_secret() {
        let c = config(&[("WMS_SYNC_WEBHOOK_SECRET", "s3cret")]).unwrap();

        assert_eq!(c.webhook_secret, b"s3cret");
        assert_eq!(c.bind, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(c.gate, AutomationGate::Paused);
        assert_eq!(c.scheduler.batch_size, 20);
        assert_eq!(c.scheduler.interval, Duration::from_secs(60));
        assert_eq!(c.retry, RetryPolicy::default());
        assert_eq!(c.poll, PollConfig::default());
        assert!(c.wms.is_none());
    }

    #[test]
    fn secret_is_required() {
        assert_eq!(
            config(&[]).unwrap_err(),
            ConfigError::Missing("WMS_SYNC_WEBHOOK_SECRET".to_string())
        );
        assert!(config(&[("WMS_SYNC_WEBHOOK_SECRET", "")]).is_err());
    }

    #[test]
    fn overrides_are_applied() {
        let c = config(&[
            ("WMS_SYNC_WEBHOOK_SECRET", "s"),
            ("WMS_SYNC_INITIAL_SYNC_COMPLETED", "true"),
            ("WMS_SYNC_MAX_ATTEMPTS", "5"),
            ("WMS_SYNC_BACKOFF_SECS", "1, 2,3"),
            ("WMS_SYNC_POLL_STOCK_MINS", "15"),
            ("WMS_SYNC_WMS_BASE_URL", "https://wms.example"),
            ("WMS_SYNC_WMS_TOKEN", "tok"),
        ])
        .unwrap();

        assert_eq!(c.gate, AutomationGate::Enabled);
        assert_eq!(c.retry.max_attempts, 5);
        assert_eq!(
            c.retry.backoff.delays(),
            &[Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(3)]
        );
        assert_eq!(c.poll.interval(EventGroup::Stock), Duration::from_secs(15 * 60));
        assert_eq!(c.poll.interval(EventGroup::Order), Duration::from_secs(4 * 3600));
        assert_eq!(
            c.wms,
            Some(WmsConfig {
                base_url: "https://wms.example".to_string(),
                token: "tok".to_string(),
                timeout: Duration::from_secs(30),
            })
        );
    }

    #[test]
    fn unparsable_values_are_errors() {
        for (name, value) in [
            ("WMS_SYNC_BATCH_SIZE", "lots"),
            ("WMS_SYNC_BATCH_SIZE", "0"),
            ("WMS_SYNC_MAX_ATTEMPTS", "0"),
            ("WMS_SYNC_BACKOFF_SECS", "30,,60"),
            ("WMS_SYNC_BIND", "localhost"),
            ("WMS_SYNC_INITIAL_SYNC_COMPLETED", "yes"),
        ] {
            let err = config(&[("WMS_SYNC_WEBHOOK_SECRET", "s"), (name, value)]).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Invalid { name: n, .. } if n == name),
                "{name}={value}: {err}"
            );
        }
    }

    #[test]
    fn zero_and_oversized_spans_are_rejected() {
        for (name, value) in [
            ("WMS_SYNC_INTERVAL_SECS", "0"),
            ("WMS_SYNC_POLL_STOCK_MINS", "0"),
            ("WMS_SYNC_POLL_WINDOW_HOURS", "0"),
            ("WMS_SYNC_WMS_TIMEOUT_SECS", "0"),
            ("WMS_SYNC_COMPACT_THRESHOLD_BYTES", "0"),
            ("WMS_SYNC_POLL_ORDER_MINS", "18446744073709551615"),
            ("WMS_SYNC_POLL_WINDOW_HOURS", "9999999999999"),
            ("WMS_SYNC_DEFERRED_TIMEOUT_HOURS", "18446744073709551615"),
            ("WMS_SYNC_RETENTION_FAILED_DAYS", "100000000"),
            ("WMS_SYNC_BACKOFF_SECS", "30,18446744073709551615"),
        ] {
            let err = config(&[("WMS_SYNC_WEBHOOK_SECRET", "s"), (name, value)]).unwrap_err();
            assert!(
                matches!(&err, ConfigError::Invalid { name: n, .. } if n == name),
                "{name}={value}: {err}"
            );
        }
    }

    #[test]
    fn zero_overlap_is_allowed() {
        let c = config(&[
            ("WMS_SYNC_WEBHOOK_SECRET", "s"),
            ("WMS_SYNC_POLL_OVERLAP_MINS", "0"),
        ])
        .unwrap();

        assert_eq!(c.poll.overlap, Duration::ZERO);
    }
}
