// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use tick::{Clock, FutureExt as _};

use crate::{Config, Error, ProviderError, RateLimiter, Result};

/// A value returned by an upstream call that the retry executor can inspect.
///
/// Upstream providers sometimes answer a throttled request with a successful response whose body
/// is a block page. Returning the body from [`Payload::text`] lets the executor recognize that case
/// and treat it as a soft-block. [`Payload::validate`] rejects successful responses that do not
/// have the expected shape; a rejected payload is retried like any other failure.
pub trait Payload {
    /// The textual body of the payload, if it has one.
    fn text(&self) -> Option<&str> {
        None
    }

    /// Checks that the payload has the expected shape.
    ///
    /// # Errors
    ///
    /// Returns a description of what is wrong with the payload.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl Payload for () {}

impl Payload for String {
    fn text(&self) -> Option<&str> {
        Some(self)
    }
}

impl<T: Payload> Payload for Option<T> {
    fn text(&self) -> Option<&str> {
        self.as_ref().and_then(Payload::text)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        self.as_ref().map_or(Ok(()), Payload::validate)
    }
}

impl<T: Payload> Payload for Vec<T> {
    fn validate(&self) -> std::result::Result<(), String> {
        self.iter().try_for_each(Payload::validate)
    }
}

/// One attempt of an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    number: u32,
    is_last: bool,
}

impl Attempt {
    pub(crate) fn new(number: u32, max_attempts: u32) -> Self {
        Self {
            number,
            is_last: number >= max_attempts,
        }
    }

    fn next(self, max_attempts: u32) -> Self {
        Self::new(self.number.saturating_add(1), max_attempts)
    }

    /// The 1-based attempt number.
    #[must_use]
    pub fn number(self) -> u32 {
        self.number
    }

    /// Whether no further attempt will follow this one.
    #[must_use]
    pub fn is_last(self) -> bool {
        self.is_last
    }
}

/// How the executor proceeds after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Outcome {
    /// The upstream throttled the call; wait for the soft backoff before going on.
    RetryableSoft,
    /// The call failed for another reason and another attempt is left.
    RetryableGeneric,
    /// The call failed and no attempt is left.
    Fatal,
}

/// Recognizes soft-block responses by the phrases they contain.
#[derive(Debug, Clone)]
struct BlockDetector {
    message_phrases: Vec<String>,
    payload_phrases: Vec<String>,
}

impl BlockDetector {
    fn new(config: &Config) -> Self {
        Self {
            message_phrases: lowercase_all(config.soft_block_phrases()),
            payload_phrases: lowercase_all(config.payload_block_phrases()),
        }
    }

    fn message_matches(&self, message: &str) -> bool {
        contains_any(message, &self.message_phrases)
    }

    fn payload_matches(&self, payload: &str) -> bool {
        contains_any(payload, &self.payload_phrases)
    }
}

fn lowercase_all(phrases: &[String]) -> Vec<String> {
    phrases.iter().map(|phrase| phrase.to_lowercase()).collect()
}

fn contains_any(text: &str, phrases: &[String]) -> bool {
    if phrases.is_empty() {
        return false;
    }
    let text = text.to_lowercase();
    phrases.iter().any(|phrase| text.contains(phrase.as_str()))
}

/// Runs upstream calls through the rate limiter with classification-aware retries.
///
/// Every attempt first passes the shared [`RateLimiter`] and is abandoned once it has run for
/// the upstream call timeout. A failed attempt is classified:
///
/// - a **soft-block** (the error message contains one of the configured soft-block phrases, or the
///   response body or a successful textual payload contains a payload block phrase) waits
///   `2^attempt × soft_backoff_base`. The wait also happens after the final attempt, before the
///   call is reported as failed.
/// - any **other** failure, including a timed-out attempt and a payload that fails
///   [`Payload::validate`], waits
///   `2^attempt × generic_backoff_base` when another attempt is left.
///
/// Once attempts are exhausted, [`Error::UpstreamFatal`] is returned. With the defaults the first
/// retry waits 4 s (generic) or 20 s (soft-block) and the second 8 s or 40 s.
///
/// The executor is cheap to clone; clones share the rate limiter.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use encore::{Config, ProviderError, RetryExecutor};
/// use tick::ClockControl;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let clock = ClockControl::new().auto_advance_timers(true).to_clock();
/// let executor = RetryExecutor::new(&Config::default(), clock);
///
/// let mut calls = 0;
/// let value = executor
///     .execute(|| {
///         calls += 1;
///         let attempt = calls;
///         async move {
///             if attempt == 1 {
///                 Err(ProviderError::new("connection reset"))
///             } else {
///                 Ok("hello".to_string())
///             }
///         }
///     })
///     .await
///     .unwrap();
///
/// assert_eq!(value, "hello");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    limiter: Arc<RateLimiter>,
    clock: Clock,
    max_attempts: u32,
    call_timeout: Duration,
    soft_backoff_base: Duration,
    generic_backoff_base: Duration,
    detector: BlockDetector,
}

impl RetryExecutor {
    /// Creates an executor with its own rate limiter.
    #[must_use]
    pub fn new(config: &Config, clock: Clock) -> Self {
        let limiter = Arc::new(RateLimiter::new(clock.clone(), config.min_request_interval()));
        Self::with_limiter(limiter, config, clock)
    }

    /// Creates an executor that dispatches through an existing rate limiter.
    #[must_use]
    pub fn with_limiter(limiter: Arc<RateLimiter>, config: &Config, clock: Clock) -> Self {
        Self {
            limiter,
            clock,
            max_attempts: config.max_retry_attempts().max(1),
            call_timeout: config.upstream_call_timeout(),
            soft_backoff_base: config.soft_backoff_base(),
            generic_backoff_base: config.generic_backoff_base(),
            detector: BlockDetector::new(config),
        }
    }

    /// The rate limiter every attempt passes through.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// How many attempts a call gets.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// How long a single attempt may run before it is abandoned.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// The wait after a soft-blocked attempt with the given 1-based number.
    #[must_use]
    pub fn soft_backoff(&self, attempt: u32) -> Duration {
        exponential(self.soft_backoff_base, attempt)
    }

    /// The wait after any other failed attempt with the given 1-based number.
    #[must_use]
    pub fn generic_backoff(&self, attempt: u32) -> Duration {
        exponential(self.generic_backoff_base, attempt)
    }

    /// Decides how to proceed after `attempt` ended with `error`.
    #[must_use]
    pub fn classify(&self, attempt: Attempt, error: &Error) -> Outcome {
        if error.is_soft_block() {
            Outcome::RetryableSoft
        } else if attempt.is_last() {
            Outcome::Fatal
        } else {
            Outcome::RetryableGeneric
        }
    }

    /// Runs `call` until it succeeds or attempts are exhausted.
    ///
    /// `call` is invoked once per attempt, after the rate limiter admits it. An attempt that has
    /// not answered within [`call_timeout`][Self::call_timeout] is dropped and counts as a
    /// generic failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UpstreamFatal`] describing the last failure once every attempt has failed.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        T: Payload,
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = Attempt::new(1, self.max_attempts);

        loop {
            self.limiter.acquire().await;

            let result = match call().timeout(&self.clock, self.call_timeout).await {
                Ok(result) => self.inspect(result),
                Err(_) => Err(Error::UpstreamTimeout(self.call_timeout)),
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = match self.classify(attempt, &error) {
                Outcome::RetryableSoft => self.soft_backoff(attempt.number()),
                Outcome::RetryableGeneric => self.generic_backoff(attempt.number()),
                Outcome::Fatal => return Err(self.exhausted(attempt, &error)),
            };

            emit_retry(attempt, delay, &error);
            self.clock.delay(delay).await;

            if attempt.is_last() {
                return Err(self.exhausted(attempt, &error));
            }
            attempt = attempt.next(self.max_attempts);
        }
    }

    fn inspect<T: Payload>(&self, result: std::result::Result<T, ProviderError>) -> Result<T> {
        match result {
            Ok(value) => {
                if let Some(text) = value.text()
                    && self.detector.payload_matches(text)
                {
                    return Err(Error::UpstreamSoftBlock("response body reports automated queries".to_string()));
                }
                value.validate().map_err(Error::InvalidPayload)?;
                Ok(value)
            }
            Err(error) => {
                let soft = self.detector.message_matches(error.message())
                    || error.body().is_some_and(|body| self.detector.payload_matches(body));
                if soft {
                    Err(Error::UpstreamSoftBlock(error.message().to_string()))
                } else {
                    Err(Error::UpstreamTransient(error.message().to_string()))
                }
            }
        }
    }

    fn exhausted(&self, attempt: Attempt, error: &Error) -> Error {
        let message = match error {
            Error::UpstreamSoftBlock(message) | Error::UpstreamTransient(message) => message.clone(),
            other => other.to_string(),
        };
        Error::UpstreamFatal {
            attempts: attempt.number().min(self.max_attempts),
            soft_blocked: error.is_soft_block(),
            message,
        }
    }
}

fn exponential(base: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

fn emit_retry(attempt: Attempt, delay: Duration, error: &Error) {
    tracing::event!(
        name: "encore.retry",
        tracing::Level::WARN,
        retry.attempt.number = attempt.number(),
        retry.attempt.is_last = attempt.is_last(),
        retry.delay = delay.as_secs_f32(),
        retry.soft_blocked = error.is_soft_block(),
        error = %error,
    );
}
