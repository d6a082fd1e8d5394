// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Serves a catalog through the cache: the first read waits for the aggregation, later reads are
//! answered from memory, and a failing upstream falls back to the cached aggregate.

use std::time::Duration;

use encore::testing::{MemoryProvider, ProviderCall};
use encore::{CacheService, CatalogAggregator, Config, ProviderError, RetryExecutor};
use tick::Clock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let provider = MemoryProvider::new();
    provider.add_song("hotel_california", "# Hotel California\n\nOn a dark desert highway...");
    provider.add_song("wonderwall", "# Wonderwall\n\nToday is gonna be the day...");
    provider.add_setlist("Friday Gig", [("Sheet1", vec![vec!["Hotel California"], vec!["Wonderwall"]])]);

    // Short intervals so the example finishes quickly.
    let config = Config::default()
        .with_min_request_interval(Duration::from_millis(100))
        .with_generic_backoff_base(Duration::from_millis(50))
        .with_max_retry_attempts(2);
    let clock = Clock::new_tokio();
    let aggregator = CatalogAggregator::new(provider, RetryExecutor::new(&config, clock.clone()));
    let service = CacheService::with_clock(aggregator, &config, clock)?;

    // Empty cache: waits for the aggregation.
    let response = service.get().await?;
    println!("first read: {}", serde_json::to_string_pretty(&response)?);

    // Answered from memory.
    let response = service.get().await?;
    println!("second read cached: {}", response.is_cached());

    // The upstream goes down; a forced refresh keeps the cached aggregate.
    service
        .aggregator()
        .provider()
        .fail_when(|call| matches!(call, ProviderCall::ListSongFolders), ProviderError::new("service unavailable"));
    let response = service.force_refresh().await?;
    println!(
        "forced refresh: refreshed={}, error={:?}",
        response.is_refreshed(),
        response.error()
    );

    Ok(())
}
