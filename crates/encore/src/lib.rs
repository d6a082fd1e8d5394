// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Keeps an aggregate of songs and setlists fresh while serving many concurrent readers.
//!
//! The aggregate is fetched from a remote, rate-limited and occasionally flaky content provider.
//! This crate provides:
//!
//! - [`CacheService`], the entry point: stale-while-revalidate reads with a TTL, background
//!   refreshes once data gets old, and a stale fallback when a refresh fails
//! - [`SingleFlightRefresher`], which coalesces concurrent refreshes into a single aggregation run
//! - [`RetryExecutor`] and [`RateLimiter`], which space upstream calls apart and retry them with
//!   exponential backoff, backing off longer when the provider reports throttling
//! - [`CatalogAggregator`], a [`DataAggregator`] that reads songs and setlists through a
//!   [`ContentProvider`]
//!
//! # Examples
//!
//! ```
//! use std::collections::BTreeMap;
//!
//! use encore::{Aggregate, CacheService, Config, Song, aggregator_fn};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), encore::Error> {
//! let aggregator = aggregator_fn(|| async {
//!     let mut songs = BTreeMap::new();
//!     songs.insert(
//!         "yesterday".to_string(),
//!         Song {
//!             title: "Yesterday".to_string(),
//!             content: "# Yesterday".to_string(),
//!         },
//!     );
//!     Ok(Aggregate { songs, ..Aggregate::default() })
//! });
//!
//! let service = CacheService::new(aggregator, &Config::default())?;
//!
//! let response = service.get().await?;
//! assert!(!response.is_cached());
//! assert_eq!(response.aggregate().songs["yesterday"].title, "Yesterday");
//!
//! let response = service.get().await?;
//! assert!(response.is_cached());
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! The crate emits `tracing` events named `encore.*` (for example `encore.retry` for every retried
//! upstream call and `encore.stale_fallback` when stale data is served after a failed refresh). No
//! subscriber is installed.

mod aggregate;
pub mod catalog;
mod config;
mod entry;
mod error;
mod freshness;
mod rate_limiter;
mod response;
mod retry;
mod service;
mod single_flight;
mod time;

#[cfg(any(feature = "test-util", test))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-util")))]
pub mod testing;

#[doc(inline)]
pub use aggregate::{Aggregate, DataAggregator, FnAggregator, Setlist, SetlistId, Song, SongId, aggregator_fn};
#[doc(inline)]
pub use catalog::{CatalogAggregator, ContentProvider, Item, SONG_DOCUMENT_NAME, title_from_folder_name};
#[doc(inline)]
pub use config::{Config, ENV_PREFIX};
#[doc(inline)]
pub use entry::Snapshot;
#[doc(inline)]
pub use error::{Error, ProviderError, Result};
#[doc(inline)]
pub use freshness::{Freshness, FreshnessPolicy};
#[doc(inline)]
pub use rate_limiter::RateLimiter;
#[doc(inline)]
pub use response::{CacheResponse, RefreshResponse};
#[doc(inline)]
pub use retry::{Attempt, Outcome, Payload, RetryExecutor};
#[doc(inline)]
pub use service::CacheService;
#[doc(inline)]
pub use single_flight::{RefreshHandle, SingleFlightRefresher};
