// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coalescing of concurrent refreshes into a single aggregation run.

use std::fmt::{self, Debug, Formatter};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use tick::{Clock, FutureExt as _};

use crate::entry::{CacheEntry, RefreshFuture};
use crate::time::unix_millis;
use crate::{Aggregate, Error, Result, Snapshot};

type SharedEntry = Arc<SyncMutex<CacheEntry>>;

/// Ensures at most one aggregation runs at a time and shares its result.
///
/// The first caller of [`SingleFlightRefresher::trigger_or_join`] while no refresh is running
/// starts one on the Tokio runtime and becomes its leader. Callers that arrive while it runs join
/// it and receive a clone of the same result. The refresh keeps running even if every caller
/// stops waiting for it.
///
/// When the aggregation finishes, a successful result is committed to the cached entry first and
/// the refresh slot is released second, both under the entry lock. Only then do waiters observe the
/// result. A failed, timed-out or panicking aggregation releases the slot and leaves the previously
/// committed payload untouched.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use encore::{Aggregate, SingleFlightRefresher};
/// use tick::Clock;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let refresher = SingleFlightRefresher::new(Clock::new_tokio(), Duration::from_secs(60));
///
/// let leader = refresher.trigger_or_join(|| async { Ok(Aggregate::default()) });
/// // Joins the running refresh; this closure is never invoked.
/// let follower = refresher.trigger_or_join(|| async { Ok(Aggregate::default()) });
///
/// assert!(leader.is_leader());
/// assert!(!follower.is_leader());
/// assert_eq!(leader.await.unwrap(), follower.await.unwrap());
/// # }
/// ```
#[derive(Debug)]
pub struct SingleFlightRefresher {
    entry: SharedEntry,
    clock: Clock,
    deadline: Duration,
}

impl SingleFlightRefresher {
    /// Creates a refresher over an empty entry; every aggregation is bounded by `deadline`.
    #[must_use]
    pub fn new(clock: Clock, deadline: Duration) -> Self {
        Self {
            entry: Arc::new(SyncMutex::new(CacheEntry::new())),
            clock,
            deadline,
        }
    }

    /// The upper bound on a single aggregation run.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// The most recently committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.entry.lock().payload().cloned()
    }

    /// Returns `true` while an aggregation is running.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        !self.entry.lock().is_idle()
    }

    /// When the most recent refresh started, whether or not it succeeded.
    #[must_use]
    pub fn last_attempt_started_at(&self) -> Option<SystemTime> {
        self.entry.lock().last_attempt_started_at()
    }

    /// Runs `f` against the entry while holding its lock.
    pub(crate) fn with_entry<R>(&self, f: impl FnOnce(&CacheEntry) -> R) -> R {
        f(&self.entry.lock())
    }

    /// Starts a refresh that runs `aggregate`, or joins the one already running.
    ///
    /// `aggregate` is only invoked if this call starts the refresh. Must be called from within a
    /// Tokio runtime.
    pub fn trigger_or_join<F, Fut>(&self, aggregate: F) -> RefreshHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Aggregate>> + Send + 'static,
    {
        let mut entry = self.entry.lock();

        if let Some(future) = entry.in_flight() {
            return RefreshHandle {
                future: future.clone(),
                leader: false,
            };
        }

        let started_at = self.clock.system_time();
        let generation = entry.begin(started_at);

        tracing::event!(
            name: "encore.refresh.start",
            tracing::Level::INFO,
            refresh.generation = generation,
            refresh.started_at = unix_millis(started_at),
        );

        // The task cannot complete before the slot is marked in flight: completion needs the lock
        // held here.
        let task = tokio::spawn(run(Arc::clone(&self.entry), self.clock.clone(), self.deadline, generation, aggregate));

        let orphaned = Arc::downgrade(&self.entry);
        let future = task
            .map(move |joined| joined.unwrap_or_else(|_| release_orphaned(&orphaned, generation)))
            .boxed()
            .shared();

        entry.set_in_flight(generation, future.clone());

        RefreshHandle { future, leader: true }
    }
}

async fn run<F, Fut>(entry: SharedEntry, clock: Clock, deadline: Duration, generation: u64, aggregate: F) -> Result<Snapshot>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Aggregate>>,
{
    let work = AssertUnwindSafe(async move { aggregate().await }).catch_unwind();

    let outcome = match work.timeout(&clock, deadline).await {
        Ok(Ok(result)) => result,
        Ok(Err(_panic)) => Err(Error::RefreshAborted),
        Err(_elapsed) => Err(Error::RefreshTimeout(deadline)),
    };

    complete(&entry, &clock, generation, outcome)
}

fn complete(entry: &SyncMutex<CacheEntry>, clock: &Clock, generation: u64, outcome: Result<Aggregate>) -> Result<Snapshot> {
    let mut entry = entry.lock();

    let result = outcome.map(|aggregate| {
        let snapshot = Snapshot::new(aggregate, clock.system_time());
        if entry.commit(snapshot.clone()) {
            snapshot
        } else {
            entry.payload().cloned().unwrap_or(snapshot)
        }
    });
    entry.finish(generation);
    drop(entry);

    match &result {
        Ok(snapshot) => tracing::event!(
            name: "encore.refresh.commit",
            tracing::Level::INFO,
            refresh.generation = generation,
            refresh.fetched_at = unix_millis(snapshot.fetched_at()),
            refresh.songs = snapshot.aggregate().songs.len(),
            refresh.setlists = snapshot.aggregate().setlists.len(),
        ),
        Err(error) => tracing::event!(
            name: "encore.refresh.failed",
            tracing::Level::WARN,
            refresh.generation = generation,
            error = %error,
        ),
    }

    result
}

/// Frees the slot of a refresh task that was torn down without completing.
fn release_orphaned(entry: &Weak<SyncMutex<CacheEntry>>, generation: u64) -> Result<Snapshot> {
    if let Some(entry) = entry.upgrade() {
        entry.lock().finish(generation);
    }

    tracing::event!(
        name: "encore.refresh.aborted",
        tracing::Level::ERROR,
        refresh.generation = generation,
    );

    Err(Error::RefreshAborted)
}

/// A handle to a running or finished refresh.
///
/// Awaiting the handle yields the refresh result; every clone yields the same result.
#[derive(Clone)]
pub struct RefreshHandle {
    future: RefreshFuture,
    leader: bool,
}

impl RefreshHandle {
    /// Returns `true` if the call that produced this handle started the refresh.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader
    }
}

impl Debug for RefreshHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshHandle").field("leader", &self.leader).finish_non_exhaustive()
    }
}

impl Future for RefreshHandle {
    type Output = Result<Snapshot>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx)
    }
}
