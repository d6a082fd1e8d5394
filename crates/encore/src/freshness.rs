// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, SystemTime};

use crate::Config;
use crate::time::age;
use crate::entry::CacheEntry;

/// The observable state of the cached aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Freshness {
    /// Nothing has been fetched yet.
    Empty,
    /// The aggregate is served as-is.
    Fresh,
    /// The aggregate is served as-is, and a background refresh is due.
    StaleBackground,
    /// The aggregate is older than the TTL; readers wait for a refresh.
    Expired,
}

/// Decides how a read is served based on the age of the cached aggregate.
///
/// All methods are pure functions of the current time and the fetch time. A fetch time later than
/// the current time counts as age zero.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, UNIX_EPOCH};
///
/// use encore::{Config, Freshness, FreshnessPolicy};
///
/// let policy = FreshnessPolicy::from_config(&Config::default());
/// let fetched_at = Some(UNIX_EPOCH);
///
/// let at = |minutes: u64| UNIX_EPOCH + Duration::from_secs(minutes * 60);
/// assert_eq!(policy.classify(at(1), fetched_at), Freshness::Fresh);
/// assert_eq!(policy.classify(at(16), fetched_at), Freshness::StaleBackground);
/// assert_eq!(policy.classify(at(31), fetched_at), Freshness::Expired);
/// assert_eq!(policy.classify(at(31), None), Freshness::Empty);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    ttl: Duration,
    background_threshold: Duration,
}

impl FreshnessPolicy {
    /// Creates a policy with the given TTL and background refresh threshold.
    #[must_use]
    pub fn new(ttl: Duration, background_threshold: Duration) -> Self {
        Self { ttl, background_threshold }
    }

    /// Creates a policy from the TTL and threshold of `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.ttl(), config.background_threshold())
    }

    /// The TTL.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The background refresh threshold.
    #[must_use]
    pub fn background_threshold(&self) -> Duration {
        self.background_threshold
    }

    /// Age of an aggregate fetched at `fetched_at`.
    #[must_use]
    pub fn age(&self, now: SystemTime, fetched_at: SystemTime) -> Duration {
        age(now, fetched_at)
    }

    /// Returns `true` if an aggregate fetched at `fetched_at` is served without waiting.
    #[must_use]
    pub fn is_fresh(&self, now: SystemTime, fetched_at: Option<SystemTime>) -> bool {
        fetched_at.is_some_and(|fetched_at| self.age(now, fetched_at) < self.ttl)
    }

    /// Returns `true` if a read should start a background refresh.
    ///
    /// `idle` tells whether no refresh is currently running.
    #[must_use]
    pub fn should_background_refresh(&self, now: SystemTime, fetched_at: Option<SystemTime>, idle: bool) -> bool {
        idle && fetched_at.is_some_and(|fetched_at| self.age(now, fetched_at) > self.background_threshold)
    }

    /// Summarizes the state of an aggregate fetched at `fetched_at`.
    #[must_use]
    pub fn classify(&self, now: SystemTime, fetched_at: Option<SystemTime>) -> Freshness {
        let Some(fetched_at) = fetched_at else {
            return Freshness::Empty;
        };

        let age = self.age(now, fetched_at);
        if age >= self.ttl {
            Freshness::Expired
        } else if age > self.background_threshold {
            Freshness::StaleBackground
        } else {
            Freshness::Fresh
        }
    }

    pub(crate) fn is_entry_fresh(&self, now: SystemTime, entry: &CacheEntry) -> bool {
        self.is_fresh(now, entry.fetched_at())
    }

    pub(crate) fn should_refresh_entry(&self, now: SystemTime, entry: &CacheEntry) -> bool {
        self.should_background_refresh(now, entry.fetched_at(), entry.is_idle())
    }
}
