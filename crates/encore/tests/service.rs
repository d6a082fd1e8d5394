// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for `CacheService` freshness, single-flight and fallback behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use encore::testing::{advance_until_complete, settle};
use encore::{
    Aggregate, CacheService, Config, DataAggregator, Error, Freshness, ProviderError, Result, RetryExecutor, Song, aggregator_fn,
};
use futures::future::join_all;
use tick::{Clock, ClockControl};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);

/// Aggregator counting its runs, optionally slow and optionally failing.
#[derive(Debug, Default)]
struct Counting {
    runs: AtomicU32,
    failing: AtomicBool,
    latency: Option<(Clock, Duration)>,
}

impl Counting {
    fn slow(clock: &Clock, latency: Duration) -> Self {
        Self {
            latency: Some((clock.clone(), latency)),
            ..Self::default()
        }
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DataAggregator for Counting {
    async fn fetch_aggregate(&self) -> Result<Aggregate> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((clock, latency)) = &self.latency {
            clock.delay(*latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Aggregation("upstream unavailable".to_string()));
        }

        let mut aggregate = Aggregate::default();
        aggregate.songs.insert(
            format!("run_{run}"),
            Song {
                title: format!("Run {run}"),
                content: String::new(),
            },
        );
        Ok(aggregate)
    }
}

fn service(control: &ClockControl, aggregator: Counting) -> CacheService<Counting> {
    CacheService::with_clock(aggregator, &Config::default(), control.to_clock()).expect("default config is valid")
}

fn at(elapsed: Duration) -> SystemTime {
    UNIX_EPOCH + elapsed
}

/// Moves time forward second by second until no refresh is running.
async fn wait_idle(control: &ClockControl, service: &CacheService<Counting>) {
    advance_until_complete(control, SECOND, async {
        while service.is_refreshing() {
            settle().await;
        }
    })
    .await;
}

#[tokio::test]
async fn freshness_timeline() {
    let control = ClockControl::new();
    let service = service(&control, Counting::default());
    let stopwatch = control.to_clock().stopwatch();
    assert_eq!(service.freshness(), Freshness::Empty);

    // t=0: empty cache, the read waits for the first refresh.
    let response = service.get().await.expect("first refresh succeeds");
    assert!(!response.is_cached());
    assert_eq!(response.fetched_at(), at(Duration::ZERO));
    assert_eq!(service.aggregator().runs(), 1);

    // t=1m: served from cache.
    control.advance(MINUTE);
    let response = service.get().await.expect("fresh read");
    assert!(response.is_cached());
    assert_eq!(response.fetched_at(), at(Duration::ZERO));
    assert_eq!(service.aggregator().runs(), 1);

    // t=16m: served from cache, and a background refresh starts.
    control.advance(15 * MINUTE);
    assert_eq!(service.freshness(), Freshness::StaleBackground);
    let before = stopwatch.elapsed();
    let response = service.get().await.expect("fresh read");
    assert_eq!(stopwatch.elapsed(), before);
    assert!(response.is_cached());
    assert_eq!(response.fetched_at(), at(Duration::ZERO));
    assert!(response.error().is_none());
    settle().await;
    assert!(!service.is_refreshing());
    assert_eq!(service.aggregator().runs(), 2);

    // t=17m: the background refresh has committed.
    control.advance(MINUTE);
    let response = service.get().await.expect("fresh read");
    assert!(response.is_cached());
    assert_eq!(response.fetched_at(), at(16 * MINUTE));
    assert!(response.aggregate().songs.contains_key("run_2"));

    // t=31m: 15 minutes after the last refresh, still fresh without a background refresh.
    control.advance(14 * MINUTE);
    let response = service.get().await.expect("fresh read");
    assert!(response.is_cached());
    assert_eq!(service.aggregator().runs(), 2);

    // t=47m: expired and the upstream fails, so the previous aggregate is served with the error.
    service.aggregator().set_failing(true);
    control.advance(16 * MINUTE);
    assert_eq!(service.freshness(), Freshness::Expired);
    let response = service.get().await.expect("stale fallback");
    assert!(response.is_cached());
    assert_eq!(response.fetched_at(), at(16 * MINUTE));
    assert_eq!(response.error(), Some("aggregation failed: upstream unavailable"));
    assert_eq!(service.last_attempt_started_at(), Some(at(47 * MINUTE)));
}

#[tokio::test]
async fn concurrent_reads_share_one_refresh() {
    let control = ClockControl::new();
    let service = service(&control, Counting::slow(&control.to_clock(), 5 * SECOND));

    let responses = advance_until_complete(&control, SECOND, join_all((0..16).map(|_| service.get()))).await;

    assert_eq!(service.aggregator().runs(), 1);
    let first = responses[0].as_ref().expect("refresh succeeds");
    for response in &responses {
        let response = response.as_ref().expect("refresh succeeds");
        assert!(!response.is_cached());
        assert_eq!(response.fetched_at(), first.fetched_at());
        assert!(Arc::ptr_eq(response.aggregate(), first.aggregate()));
    }
    assert_eq!(first.fetched_at(), at(5 * SECOND));
}

#[tokio::test]
async fn concurrent_reads_from_spawned_tasks() {
    let control = ClockControl::new();
    let service = Arc::new(service(&control, Counting::slow(&control.to_clock(), SECOND)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.get().await })
        })
        .collect();

    let fetched = advance_until_complete(&control, SECOND, async {
        let mut fetched = Vec::new();
        for task in tasks {
            fetched.push(task.await.expect("task completes").expect("refresh succeeds").fetched_at());
        }
        fetched
    })
    .await;

    assert_eq!(service.aggregator().runs(), 1);
    assert!(fetched.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test]
async fn fetched_at_never_moves_backwards() {
    let control = ClockControl::new();
    let service = service(&control, Counting::slow(&control.to_clock(), 3 * SECOND));
    let mut previous = UNIX_EPOCH;

    for step in 0..6 {
        if step == 3 {
            service.aggregator().set_failing(true);
        }
        if step == 5 {
            service.aggregator().set_failing(false);
        }

        let fetched_at = match advance_until_complete(&control, SECOND, service.get()).await {
            Ok(response) => response.fetched_at(),
            Err(error) => panic!("cache was populated at step 0: {error}"),
        };
        assert!(fetched_at >= previous);
        previous = fetched_at;

        control.advance(20 * MINUTE);
        wait_idle(&control, &service).await;
    }
}

#[tokio::test]
async fn empty_cache_with_failing_upstream_has_no_data() {
    let aggregator = Counting::default();
    aggregator.set_failing(true);
    let service = service(&ClockControl::new(), aggregator);

    let error = service.get().await.unwrap_err();

    assert!(matches!(error, Error::NoDataAvailable { .. }));
    assert!(service.snapshot().is_none());
    assert!(matches!(service.force_refresh().await, Err(Error::NoDataAvailable { .. })));
}

#[tokio::test]
async fn force_refresh_reports_outcome() {
    let control = ClockControl::new();
    let service = service(&control, Counting::default());

    let response = service.force_refresh().await.expect("refresh succeeds");
    assert!(response.is_refreshed());
    assert!(response.error().is_none());

    control.advance(MINUTE);
    let response = service.force_refresh().await.expect("refresh succeeds");
    assert!(response.is_refreshed());
    assert_eq!(response.fetched_at(), at(MINUTE));
    assert_eq!(service.aggregator().runs(), 2);

    service.aggregator().set_failing(true);
    control.advance(MINUTE);
    let response = service.force_refresh().await.expect("stale fallback");
    assert!(!response.is_refreshed());
    assert_eq!(response.fetched_at(), at(MINUTE));
    assert!(response.error().is_some());
}

#[tokio::test]
async fn force_refresh_joins_running_refresh() {
    let control = ClockControl::new();
    let service = service(&control, Counting::slow(&control.to_clock(), 10 * SECOND));

    let (read, forced) = advance_until_complete(&control, SECOND, async { tokio::join!(service.get(), service.force_refresh()) }).await;

    assert_eq!(service.aggregator().runs(), 1);
    assert_eq!(
        read.expect("refresh succeeds").fetched_at(),
        forced.expect("refresh succeeds").fetched_at()
    );
}

#[tokio::test]
async fn background_failure_keeps_serving_cached_data() {
    let control = ClockControl::new();
    let service = service(&control, Counting::default());
    let first = service.get().await.expect("first refresh succeeds");

    service.aggregator().set_failing(true);
    control.advance(20 * MINUTE);
    let response = service.get().await.expect("fresh read");
    settle().await;

    assert!(response.is_cached());
    assert!(response.error().is_none());
    assert!(!service.is_refreshing());
    assert_eq!(service.aggregator().runs(), 2);
    assert_eq!(service.snapshot(), Some(first.snapshot().clone()));
}

#[tokio::test]
async fn hung_refresh_times_out_and_releases_slot() {
    let control = ClockControl::new();
    let config = Config::default()
        .with_ttl(MINUTE)
        .with_background_threshold(30 * SECOND)
        .with_refresh_timeout(90 * SECOND);
    let clock = control.to_clock();
    let stopwatch = clock.stopwatch();
    let service = CacheService::with_clock(Counting::slow(&clock, Duration::MAX), &config, clock).expect("valid config");

    let error = advance_until_complete(&control, SECOND, service.get()).await.unwrap_err();

    let Error::NoDataAvailable { cause } = error else {
        panic!("expected no data, got {error}");
    };
    assert!(matches!(*cause, Error::RefreshTimeout(timeout) if timeout == 90 * SECOND));
    assert_eq!(stopwatch.elapsed(), 90 * SECOND);
    assert!(!service.is_refreshing());
}

#[tokio::test]
async fn hung_upstream_call_fails_long_before_refresh_timeout() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let executor = RetryExecutor::new(&Config::default(), clock.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let aggregator = aggregator_fn(move || {
        let executor = executor.clone();
        let counter = Arc::clone(&counter);
        async move {
            executor
                .execute(|| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    futures::future::pending::<std::result::Result<String, ProviderError>>()
                })
                .await?;
            Ok(Aggregate::default())
        }
    });
    let service = CacheService::with_clock(aggregator, &Config::default(), clock.clone()).expect("default config is valid");
    let stopwatch = clock.stopwatch();

    let error = advance_until_complete(&control, SECOND, service.get()).await.unwrap_err();

    let Error::NoDataAvailable { cause } = error else {
        panic!("expected no data, got {error}");
    };
    assert!(matches!(&*cause, Error::UpstreamFatal { attempts: 3, soft_blocked: false, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Three 30 s attempts with 4 s and 8 s of backoff in between.
    assert_eq!(stopwatch.elapsed(), Duration::from_secs(30 + 4 + 30 + 8 + 30));
    assert!(stopwatch.elapsed() < Config::default().refresh_timeout());
    assert!(!service.is_refreshing());
}

#[tokio::test]
async fn responses_serialize_for_handlers() {
    let control = ClockControl::new();
    let service = service(&control, Counting::default());

    let json = serde_json::to_value(service.get().await.expect("refresh succeeds")).expect("serializable");
    assert_eq!(json["cached"], false);
    assert_eq!(json["fetchedAt"], 0);
    assert_eq!(json["songs"]["run_1"]["title"], "Run 1");
    assert!(json.get("error").is_none());

    service.aggregator().set_failing(true);
    control.advance(MINUTE);
    let json = serde_json::to_value(service.force_refresh().await.expect("stale fallback")).expect("serializable");
    assert_eq!(json["refreshed"], false);
    assert_eq!(json["fetchedAt"], 0);
    assert_eq!(json["error"], "aggregation failed: upstream unavailable");
}

#[tokio::test]
async fn soft_block_then_success_waits_for_soft_backoff() {
    let control = ClockControl::new();
    let clock = control.to_clock();
    let executor = RetryExecutor::new(&Config::default(), clock.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let aggregator = aggregator_fn(move || {
        let executor = executor.clone();
        let counter = Arc::clone(&counter);
        async move {
            let content = executor
                .execute(|| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt == 0 {
                            Err(ProviderError::new("429: rate limit exceeded"))
                        } else {
                            Ok("# Yesterday".to_string())
                        }
                    }
                })
                .await?;

            let mut aggregate = Aggregate::default();
            aggregate.songs.insert(
                "yesterday".to_string(),
                Song {
                    title: "Yesterday".to_string(),
                    content,
                },
            );
            Ok(aggregate)
        }
    });
    let service = CacheService::with_clock(aggregator, &Config::default(), clock.clone()).expect("default config is valid");
    let stopwatch = clock.stopwatch();

    let response = advance_until_complete(&control, SECOND, service.get()).await.expect("second attempt succeeds");

    assert!(!response.is_cached());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(stopwatch.elapsed(), 20 * SECOND);
    assert_eq!(response.fetched_at(), at(20 * SECOND));
    assert_eq!(response.aggregate().songs["yesterday"].content, "# Yesterday");
}
