// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Serialize, Serializer};

use crate::time::unix_millis;
use crate::{Aggregate, Setlist, SetlistId, Snapshot, Song, SongId};

/// The answer to [`CacheService::get`][crate::CacheService::get].
///
/// Serializes to `{songs, setlists, cached, fetchedAt, error?}` with `fetchedAt` in Unix
/// milliseconds; `error` is only present when a failed refresh was answered with stale data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResponse {
    snapshot: Snapshot,
    cached: bool,
    error: Option<String>,
}

impl CacheResponse {
    pub(crate) fn new(snapshot: Snapshot, cached: bool, error: Option<String>) -> Self {
        Self { snapshot, cached, error }
    }

    /// The served snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The served aggregate.
    #[must_use]
    pub fn aggregate(&self) -> &Arc<Aggregate> {
        self.snapshot.aggregate()
    }

    /// When the served aggregate was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> SystemTime {
        self.snapshot.fetched_at()
    }

    /// Returns `true` if the aggregate was served from the cache rather than from a refresh that
    /// this call waited for.
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Description of the refresh failure, if stale data was served because of one.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// The answer to [`CacheService::force_refresh`][crate::CacheService::force_refresh].
///
/// Serializes to `{songs, setlists, refreshed, fetchedAt, error?}` with `fetchedAt` in Unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshResponse {
    snapshot: Snapshot,
    refreshed: bool,
    error: Option<String>,
}

impl RefreshResponse {
    pub(crate) fn new(snapshot: Snapshot, refreshed: bool, error: Option<String>) -> Self {
        Self { snapshot, refreshed, error }
    }

    /// The served snapshot.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// The served aggregate.
    #[must_use]
    pub fn aggregate(&self) -> &Arc<Aggregate> {
        self.snapshot.aggregate()
    }

    /// When the served aggregate was fetched.
    #[must_use]
    pub fn fetched_at(&self) -> SystemTime {
        self.snapshot.fetched_at()
    }

    /// Returns `true` only if the refresh succeeded.
    #[must_use]
    pub fn is_refreshed(&self) -> bool {
        self.refreshed
    }

    /// Description of the refresh failure, if the refresh failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Wire<'a> {
    songs: &'a BTreeMap<SongId, Song>,
    setlists: &'a BTreeMap<SetlistId, Setlist>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cached: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refreshed: Option<bool>,
    fetched_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

impl<'a> Wire<'a> {
    fn new(snapshot: &'a Snapshot, error: Option<&'a str>) -> Self {
        Self {
            songs: &snapshot.aggregate().songs,
            setlists: &snapshot.aggregate().setlists,
            cached: None,
            refreshed: None,
            fetched_at: unix_millis(snapshot.fetched_at()),
            error,
        }
    }
}

impl Serialize for CacheResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Wire {
            cached: Some(self.cached),
            ..Wire::new(&self.snapshot, self.error())
        }
        .serialize(serializer)
    }
}

impl Serialize for RefreshResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Wire {
            refreshed: Some(self.refreshed),
            ..Wire::new(&self.snapshot, self.error())
        }
        .serialize(serializer)
    }
}
