// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::SystemTime;

use tick::Clock;

use crate::single_flight::RefreshHandle;
use crate::time::unix_millis;
use crate::{
    CacheResponse, Config, DataAggregator, Error, Freshness, FreshnessPolicy, RefreshResponse, Result, SingleFlightRefresher, Snapshot,
};

/// Serves the aggregate with stale-while-revalidate semantics.
///
/// - While the cached aggregate is younger than the TTL, [`CacheService::get`] answers immediately
///   from the cache. Once it is older than the background threshold, the read also starts a
///   refresh in the background; its failure is only logged.
/// - When nothing is cached or the cached aggregate has expired, the read waits for a refresh,
///   joining the one already running if there is one.
/// - When a refresh fails, the previously cached aggregate is served along with a description of
///   the failure. With nothing cached, the call fails with [`Error::NoDataAvailable`].
///
/// Only one aggregation runs at a time, however many callers ask for one.
///
/// # Examples
///
/// ```
/// use encore::{Aggregate, CacheService, Config, aggregator_fn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), encore::Error> {
/// let service = CacheService::new(aggregator_fn(|| async { Ok(Aggregate::default()) }), &Config::default())?;
///
/// let first = service.get().await?;
/// assert!(!first.is_cached());
///
/// let second = service.get().await?;
/// assert!(second.is_cached());
/// assert_eq!(first.fetched_at(), second.fetched_at());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CacheService<A> {
    aggregator: Arc<A>,
    refresher: SingleFlightRefresher,
    policy: FreshnessPolicy,
    clock: Clock,
}

impl<A: DataAggregator> CacheService<A> {
    /// Creates a service with an empty cache, reading time from a clock driven by the Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not pass [`Config::validate`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime context with a valid `config`.
    pub fn new(aggregator: A, config: &Config) -> Result<Self> {
        config.validate()?;
        Self::with_clock(aggregator, config, Clock::new_tokio())
    }

    /// Creates a service with an empty cache that reads time from `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` does not pass [`Config::validate`].
    pub fn with_clock(aggregator: A, config: &Config, clock: Clock) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            aggregator: Arc::new(aggregator),
            refresher: SingleFlightRefresher::new(clock.clone(), config.refresh_timeout()),
            policy: FreshnessPolicy::from_config(config),
            clock,
        })
    }

    /// The aggregator refreshes run.
    #[must_use]
    pub fn aggregator(&self) -> &A {
        &self.aggregator
    }

    /// The policy deciding how reads are served.
    #[must_use]
    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// The currently cached snapshot, without triggering a refresh.
    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.refresher.snapshot()
    }

    /// The current state of the cached aggregate.
    #[must_use]
    pub fn freshness(&self) -> Freshness {
        let now = self.clock.system_time();
        self.refresher.with_entry(|entry| self.policy.classify(now, entry.fetched_at()))
    }

    /// When the most recent refresh started, whether or not it succeeded.
    #[must_use]
    pub fn last_attempt_started_at(&self) -> Option<SystemTime> {
        self.refresher.last_attempt_started_at()
    }

    /// Returns `true` while a refresh is running.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refresher.is_refreshing()
    }

    /// Returns the aggregate, refreshing it first if it is missing or expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataAvailable`] if a refresh was needed, it failed, and nothing was
    /// cached before.
    pub async fn get(&self) -> Result<CacheResponse> {
        let now = self.clock.system_time();
        let (fresh, refresh_due) = self.refresher.with_entry(|entry| {
            let fresh = entry.payload().filter(|_| self.policy.is_entry_fresh(now, entry)).cloned();
            (fresh, self.policy.should_refresh_entry(now, entry))
        });

        if let Some(snapshot) = fresh {
            if refresh_due {
                self.refresh_in_background();
            }
            return Ok(CacheResponse::new(snapshot, true, None));
        }

        match self.trigger().await {
            Ok(snapshot) => Ok(CacheResponse::new(snapshot, false, None)),
            Err(error) => {
                let prior = self.fallback(error)?;
                Ok(CacheResponse::new(prior.snapshot, true, Some(prior.error)))
            }
        }
    }

    /// Refreshes the aggregate regardless of its age, joining a refresh already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataAvailable`] if the refresh failed and nothing was cached before.
    pub async fn force_refresh(&self) -> Result<RefreshResponse> {
        match self.trigger().await {
            Ok(snapshot) => Ok(RefreshResponse::new(snapshot, true, None)),
            Err(error) => {
                let prior = self.fallback(error)?;
                Ok(RefreshResponse::new(prior.snapshot, false, Some(prior.error)))
            }
        }
    }

    fn trigger(&self) -> RefreshHandle {
        let aggregator = Arc::clone(&self.aggregator);
        self.refresher
            .trigger_or_join(move || async move { aggregator.fetch_aggregate().await })
    }

    fn refresh_in_background(&self) {
        let handle = self.trigger();
        if !handle.is_leader() {
            return;
        }

        tokio::spawn(async move {
            if let Err(error) = handle.await {
                tracing::event!(
                    name: "encore.refresh.background_failed",
                    tracing::Level::WARN,
                    error = %error,
                );
            }
        });
    }

    fn fallback(&self, error: Error) -> Result<Fallback> {
        let Some(snapshot) = self.refresher.snapshot() else {
            tracing::event!(
                name: "encore.no_data",
                tracing::Level::ERROR,
                error = %error,
            );
            return Err(Error::no_data(error));
        };

        tracing::event!(
            name: "encore.stale_fallback",
            tracing::Level::WARN,
            fallback.fetched_at = unix_millis(snapshot.fetched_at()),
            error = %error,
        );

        Ok(Fallback {
            snapshot,
            error: error.to_string(),
        })
    }
}

struct Fallback {
    snapshot: Snapshot,
    error: String,
}
