//! Reconciliation polling schedule.
//!
//! Webhooks are the primary source of events, but they are not sufficient
//! alone: WMS outages, network failures, or our own downtime lose
//! notifications. Each event category is therefore polled directly at its
//! own cadence.
//!
//! # Polling Strategy
//!
//! | Category | Interval |
//! |----------|----------|
//! | stock | 1 hour |
//! | order, shipment, inbound | 4 hours |
//! | article | 24 hours |
//!
//! - **Jitter**: 0-10% added per category so polls drift apart
//! - **Initial stagger**: derived from the category hash, within half an
//!   interval, so a restart does not fire every category at once
//! - **Lookback**: first run covers `window`; later runs start `overlap`
//!   before the previous run

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use crate::types::EventGroup;

const HOUR: u64 = 60 * 60;

/// Default lookback for a category that has never been polled (24 hours).
const DEFAULT_WINDOW_SECS: u64 = 24 * HOUR;

/// Default overlap with the previous run (10 minutes).
const DEFAULT_OVERLAP_SECS: u64 = 10 * 60;

const DEFAULT_JITTER_PERCENT: u8 = 10;

/// Floor applied to configured intervals so a zero never spins the poller.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

fn default_interval(group: EventGroup) -> Duration {
    match group {
        EventGroup::Stock => Duration::from_secs(HOUR),
        EventGroup::Order | EventGroup::Shipment | EventGroup::Inbound => {
            Duration::from_secs(4 * HOUR)
        }
        EventGroup::Article => Duration::from_secs(24 * HOUR),
    }
}

/// Configuration for reconciliation polling.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Poll interval per category.
    pub intervals: HashMap<EventGroup, Duration>,

    /// Lookback on the first run of a category.
    pub window: Duration,

    /// How far before the previous run's start the next run looks back, so
    /// changes recorded late by the WMS are not missed.
    pub overlap: Duration,

    /// Jitter percentage added to each interval (0-100).
    pub jitter_percent: u8,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            intervals: EventGroup::ALL
                .into_iter()
                .map(|g| (g, default_interval(g)))
                .collect(),
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            overlap: Duration::from_secs(DEFAULT_OVERLAP_SECS),
            jitter_percent: DEFAULT_JITTER_PERCENT,
        }
    }
}

impl PollConfig {
    /// The configured interval for a category.
    pub fn interval(&self, group: EventGroup) -> Duration {
        self.intervals
            .get(&group)
            .copied()
            .unwrap_or_else(|| default_interval(group))
            .max(MIN_INTERVAL)
    }

    /// The interval with deterministic per-category jitter added.
    ///
    /// `interval * (1 + (hash(group) % jitter_percent) / 100)`
    pub fn interval_with_jitter(&self, group: EventGroup) -> Duration {
        let interval = self.interval(group);
        if self.jitter_percent == 0 {
            return interval;
        }
        let jitter = (group_hash(group) % self.jitter_percent as u64) as f64 / 100.0;
        Duration::try_from_secs_f64(interval.as_secs_f64() * (1.0 + jitter)).unwrap_or(interval)
    }

    /// Delay before a category's first poll: `hash(group) % (interval / 2)`.
    pub fn initial_delay(&self, group: EventGroup) -> Duration {
        let max_delay = self.interval(group).as_secs() / 2;
        Duration::from_secs(group_hash(group) % max_delay.max(1))
    }
}

fn group_hash(group: EventGroup) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    group.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals_per_category() {
        let config = PollConfig::default();

        assert_eq!(config.interval(EventGroup::Stock), Duration::from_secs(3600));
        assert_eq!(config.interval(EventGroup::Order), Duration::from_secs(4 * 3600));
        assert_eq!(config.interval(EventGroup::Inbound), Duration::from_secs(4 * 3600));
        assert_eq!(config.interval(EventGroup::Article), Duration::from_secs(24 * 3600));
        assert_eq!(config.window, Duration::from_secs(24 * 3600));
        assert_eq!(config.overlap, Duration::from_secs(600));
    }

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let config = PollConfig::default();
        for group in EventGroup::ALL {
            let a = config.interval_with_jitter(group);
            let b = config.interval_with_jitter(group);
            assert_eq!(a, b);
            assert!(a >= config.interval(group));
            assert!(a <= config.interval(group).mul_f64(1.1));
        }
    }

    #[test]
    fn zero_jitter_returns_exact_interval() {
        let config = PollConfig {
            jitter_percent: 0,
            ..PollConfig::default()
        };
        assert_eq!(
            config.interval_with_jitter(EventGroup::Stock),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn initial_delay_is_within_half_interval() {
        let config = PollConfig::default();
        for group in EventGroup::ALL {
            assert!(config.initial_delay(group) < config.interval(group) / 2);
        }
    }

    #[test]
    fn missing_interval_falls_back_to_default() {
        let config = PollConfig {
            intervals: HashMap::new(),
            ..PollConfig::default()
        };
        assert_eq!(config.interval(EventGroup::Stock), Duration::from_secs(3600));
    }

    #[test]
    fn degenerate_intervals_stay_usable() {
        let config = PollConfig {
            intervals: HashMap::from([
                (EventGroup::Stock, Duration::ZERO),
                (EventGroup::Order, Duration::MAX),
            ]),
            ..PollConfig::default()
        };

        assert_eq!(config.interval(EventGroup::Stock), Duration::from_secs(1));
        assert!(config.interval_with_jitter(EventGroup::Stock) >= Duration::from_secs(1));
        assert_eq!(config.interval_with_jitter(EventGroup::Order), Duration::MAX);
        assert!(config.initial_delay(EventGroup::Order) < Duration::MAX);
    }
}
