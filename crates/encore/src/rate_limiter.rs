// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::{Duration, Instant};

use tick::Clock;
use tokio::sync::Mutex;

/// Enforces a minimum spacing between outbound calls to the upstream provider.
///
/// Callers pass through a single gate: [`RateLimiter::acquire`] waits until at least
/// `min_interval` has elapsed since the previous dispatch, records the new dispatch time and only
/// then lets the next caller in. Waiting happens while the gate is held, so acquisitions are
/// served one at a time in arrival order and two callers can never both observe that enough time
/// has passed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use encore::RateLimiter;
/// use tick::ClockControl;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let clock = ClockControl::new().auto_advance_timers(true).to_clock();
/// let limiter = RateLimiter::new(clock, Duration::from_secs(2));
///
/// assert_eq!(limiter.acquire().await, Duration::ZERO);
/// assert_eq!(limiter.acquire().await, Duration::from_secs(2));
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    clock: Clock,
    min_interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter that spaces dispatches at least `min_interval` apart.
    #[must_use]
    pub fn new(clock: Clock, min_interval: Duration) -> Self {
        Self {
            clock,
            min_interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// The minimum spacing between two dispatches.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a call may be dispatched and records the dispatch.
    ///
    /// Returns how long the caller was held back by the spacing rule. Time spent queued behind
    /// other callers is not included.
    pub async fn acquire(&self) -> Duration {
        let mut last_dispatch = self.last_dispatch.lock().await;

        let waited = match *last_dispatch {
            Some(last) => {
                let permitted_at = last + self.min_interval;
                let wait = permitted_at.saturating_duration_since(self.clock.instant());
                if !wait.is_zero() {
                    tracing::event!(
                        name: "encore.rate_limit.wait",
                        tracing::Level::DEBUG,
                        rate_limit.wait = wait.as_secs_f32(),
                    );
                    self.clock.delay(wait).await;
                }
                wait
            }
            None => Duration::ZERO,
        };

        *last_dispatch = Some(self.clock.instant());
        waited
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tick::ClockControl;

    use super::*;

    fn limiter(control: &ClockControl) -> RateLimiter {
        RateLimiter::new(control.to_clock(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn first_call_is_not_delayed() {
        let control = ClockControl::new().auto_advance_timers(true);
        let stopwatch = control.to_clock().stopwatch();

        assert_eq!(limiter(&control).acquire().await, Duration::ZERO);
        assert_eq!(stopwatch.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn waits_only_for_remaining_interval() {
        let control = ClockControl::new().auto_advance_timers(true);
        let limiter = limiter(&control);
        limiter.acquire().await;

        control.advance(Duration::from_millis(500));

        assert_eq!(limiter.acquire().await, Duration::from_millis(1_500));
    }

    #[tokio::test]
    async fn idle_limiter_does_not_delay() {
        let control = ClockControl::new().auto_advance_timers(true);
        let limiter = limiter(&control);
        limiter.acquire().await;

        control.advance(Duration::from_secs(10));

        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn concurrent_callers_are_spaced() {
        let control = ClockControl::new().auto_advance_timers(true);
        let clock = control.to_clock();
        let limiter = Arc::new(limiter(&control));
        let start = clock.instant();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let clock = clock.clone();
                tokio::spawn(async move {
                    limiter.acquire().await;
                    clock.instant()
                })
            })
            .collect();

        let mut dispatched = Vec::new();
        for handle in handles {
            dispatched.push(handle.await.expect("task should not panic") - start);
        }
        dispatched.sort();

        assert_eq!(
            dispatched,
            [
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(6)
            ]
        );
    }
}
