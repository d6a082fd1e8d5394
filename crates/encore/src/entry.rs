// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use futures::future::{BoxFuture, Shared};

use crate::{Aggregate, Result};

/// A successfully fetched aggregate together with the time it was fetched.
///
/// The payload and its timestamp only ever travel together, so no reader can observe the payload
/// of one refresh with the timestamp of another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    aggregate: Arc<Aggregate>,
    fetched_at: SystemTime,
}

impl Snapshot {
    /// Creates a snapshot of `aggregate` fetched at `fetched_at`.
    #[must_use]
    pub fn new(aggregate: impl Into<Arc<Aggregate>>, fetched_at: SystemTime) -> Self {
        Self {
            aggregate: aggregate.into(),
            fetched_at,
        }
    }

    /// The aggregate.
    #[must_use]
    pub fn aggregate(&self) -> &Arc<Aggregate> {
        &self.aggregate
    }

    /// When the aggregate was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> SystemTime {
        self.fetched_at
    }
}

pub(crate) type RefreshFuture = Shared<BoxFuture<'static, Result<Snapshot>>>;

/// Whether a refresh is running.
pub(crate) enum RefreshState {
    Idle,
    InFlight { generation: u64, future: RefreshFuture },
}

impl Debug for RefreshState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::InFlight { generation, .. } => f.debug_struct("InFlight").field("generation", generation).finish_non_exhaustive(),
        }
    }
}

/// The single cached value and the bookkeeping around it.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    payload: Option<Snapshot>,
    last_attempt_started_at: Option<SystemTime>,
    refresh: RefreshState,
    generation: u64,
}

impl CacheEntry {
    pub(crate) fn new() -> Self {
        Self {
            payload: None,
            last_attempt_started_at: None,
            refresh: RefreshState::Idle,
            generation: 0,
        }
    }

    pub(crate) fn payload(&self) -> Option<&Snapshot> {
        self.payload.as_ref()
    }

    pub(crate) fn fetched_at(&self) -> Option<SystemTime> {
        self.payload.as_ref().map(Snapshot::fetched_at)
    }

    pub(crate) fn last_attempt_started_at(&self) -> Option<SystemTime> {
        self.last_attempt_started_at
    }

    pub(crate) fn is_idle(&self) -> bool {
        matches!(self.refresh, RefreshState::Idle)
    }

    pub(crate) fn in_flight(&self) -> Option<&RefreshFuture> {
        match &self.refresh {
            RefreshState::Idle => None,
            RefreshState::InFlight { future, .. } => Some(future),
        }
    }

    /// Marks a new refresh as started and returns its generation.
    pub(crate) fn begin(&mut self, started_at: SystemTime) -> u64 {
        self.generation = self.generation.wrapping_add(1);
        self.last_attempt_started_at = Some(started_at);
        self.generation
    }

    pub(crate) fn set_in_flight(&mut self, generation: u64, future: RefreshFuture) {
        self.refresh = RefreshState::InFlight { generation, future };
    }

    /// Releases the refresh slot if it still belongs to `generation`.
    pub(crate) fn finish(&mut self, generation: u64) {
        if matches!(self.refresh, RefreshState::InFlight { generation: current, .. } if current == generation) {
            self.refresh = RefreshState::Idle;
        }
    }

    /// Stores `snapshot` unless a newer one is already stored.
    ///
    /// Returns `true` if the snapshot was stored.
    pub(crate) fn commit(&mut self, snapshot: Snapshot) -> bool {
        match &self.payload {
            Some(current) if current.fetched_at > snapshot.fetched_at => false,
            _ => {
                self.payload = Some(snapshot);
                true
            }
        }
    }
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use futures::FutureExt;

    use super::*;

    fn snapshot_at(secs: u64) -> Snapshot {
        Snapshot::new(Aggregate::default(), UNIX_EPOCH + Duration::from_secs(secs))
    }

    #[test]
    fn commit_never_moves_backwards() {
        let mut entry = CacheEntry::new();

        assert!(entry.commit(snapshot_at(10)));
        assert!(!entry.commit(snapshot_at(5)));
        assert_eq!(entry.fetched_at(), Some(UNIX_EPOCH + Duration::from_secs(10)));
        assert!(entry.commit(snapshot_at(10)));
        assert!(entry.commit(snapshot_at(20)));
        assert_eq!(entry.fetched_at(), Some(UNIX_EPOCH + Duration::from_secs(20)));
    }

    #[test]
    fn finish_ignores_stale_generation() {
        let mut entry = CacheEntry::new();
        let future = async { Ok(snapshot_at(1)) }.boxed().shared();

        let first = entry.begin(UNIX_EPOCH);
        entry.set_in_flight(first, future.clone());
        entry.finish(first);
        assert!(entry.is_idle());

        let second = entry.begin(UNIX_EPOCH + Duration::from_secs(1));
        entry.set_in_flight(second, future);
        entry.finish(first);

        assert!(!entry.is_idle());
        assert!(entry.in_flight().is_some());
        assert_eq!(entry.last_attempt_started_at(), Some(UNIX_EPOCH + Duration::from_secs(1)));
        assert_eq!(format!("{:?}", entry.refresh), "InFlight { generation: 2, .. }");
    }

    #[test]
    fn new_entry_is_empty_and_idle() {
        let entry = CacheEntry::default();

        assert!(entry.is_idle());
        assert!(entry.payload().is_none());
        assert_eq!(entry.fetched_at(), None);
        assert_eq!(entry.last_attempt_started_at(), None);
    }
}
