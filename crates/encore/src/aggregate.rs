// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Identifier of a song, the name of the folder it lives in.
pub type SongId = String;

/// Identifier of a setlist.
pub type SetlistId = String;

/// A song document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    /// Human-readable title.
    pub title: String,
    /// Raw document text.
    pub content: String,
}

/// An ordered list of song names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setlist {
    /// Display name.
    pub name: String,
    /// Song names in play order.
    pub songs: Vec<String>,
}

/// Everything the cache serves: all songs and all setlists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    /// Songs by id.
    pub songs: BTreeMap<SongId, Song>,
    /// Setlists by id.
    pub setlists: BTreeMap<SetlistId, Setlist>,
}

impl Aggregate {
    /// Returns `true` if the aggregate holds neither songs nor setlists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.songs.is_empty() && self.setlists.is_empty()
    }
}

/// Produces a complete [`Aggregate`] from the upstream provider.
///
/// Implementations are expected to route every upstream call through a
/// [`RetryExecutor`][crate::RetryExecutor] so that calls are rate limited and retried. The cache
/// never runs two aggregations at once.
pub trait DataAggregator: Send + Sync + 'static {
    /// Fetches the whole aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregate cannot be produced. The cache keeps serving the previous
    /// aggregate, if any.
    fn fetch_aggregate(&self) -> impl Future<Output = Result<Aggregate>> + Send;
}

/// Creates a [`DataAggregator`] from an async closure.
///
/// # Examples
///
/// ```
/// use encore::{Aggregate, DataAggregator, aggregator_fn};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let aggregator = aggregator_fn(|| async { Ok(Aggregate::default()) });
///
/// assert!(aggregator.fetch_aggregate().await.unwrap().is_empty());
/// # }
/// ```
pub fn aggregator_fn<F, Fut>(f: F) -> FnAggregator<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Aggregate>> + Send,
{
    FnAggregator { f }
}

/// A [`DataAggregator`] backed by a closure, created by [`aggregator_fn`].
#[derive(Clone, Copy)]
pub struct FnAggregator<F> {
    f: F,
}

impl<F> Debug for FnAggregator<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAggregator").finish_non_exhaustive()
    }
}

impl<F, Fut> DataAggregator for FnAggregator<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Aggregate>> + Send,
{
    fn fetch_aggregate(&self) -> impl Future<Output = Result<Aggregate>> + Send {
        (self.f)()
    }
}
