// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_BACKGROUND_THRESHOLD: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(2_000);
const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_SOFT_BACKOFF_BASE: Duration = Duration::from_secs(10);
const DEFAULT_GENERIC_BACKOFF_BASE: Duration = Duration::from_secs(2);
const DEFAULT_UPSTREAM_CALL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SOFT_BLOCK_PHRASES: [&str; 2] = ["automated queries", "rate limit"];
const DEFAULT_PAYLOAD_BLOCK_PHRASES: [&str; 1] = ["automated queries"];

/// Prefix of the environment variables read by [`Config::from_env`].
pub const ENV_PREFIX: &str = "ENCORE_";

/// Tunable knobs of the cache and of the upstream call discipline.
///
/// The defaults keep cached data for 30 minutes, start a background refresh once data is older
/// than 15 minutes, space upstream calls at least 2 seconds apart and make up to 3 attempts per
/// call, each abandoned after 30 seconds.
///
/// A configuration can be built in code with the `with_*` methods, deserialized (camelCase keys,
/// durations in milliseconds, missing keys take their default) or read from `ENCORE_*`
/// environment variables.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use encore::Config;
///
/// let config = Config::default()
///     .with_ttl(Duration::from_secs(60))
///     .with_background_threshold(Duration::from_secs(30));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.refresh_timeout(), Duration::from_secs(180));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    ttl_ms: u64,
    background_threshold_ms: u64,
    min_request_interval_ms: u64,
    max_retry_attempts: u32,
    soft_backoff_base_ms: u64,
    generic_backoff_base_ms: u64,
    upstream_call_timeout_ms: u64,
    refresh_timeout_ms: Option<u64>,
    soft_block_phrases: Vec<String>,
    payload_block_phrases: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ttl_ms: millis(DEFAULT_TTL),
            background_threshold_ms: millis(DEFAULT_BACKGROUND_THRESHOLD),
            min_request_interval_ms: millis(DEFAULT_MIN_REQUEST_INTERVAL),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            soft_backoff_base_ms: millis(DEFAULT_SOFT_BACKOFF_BASE),
            generic_backoff_base_ms: millis(DEFAULT_GENERIC_BACKOFF_BASE),
            upstream_call_timeout_ms: millis(DEFAULT_UPSTREAM_CALL_TIMEOUT),
            refresh_timeout_ms: None,
            soft_block_phrases: DEFAULT_SOFT_BLOCK_PHRASES.iter().map(ToString::to_string).collect(),
            payload_block_phrases: DEFAULT_PAYLOAD_BLOCK_PHRASES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// See [`Config::from_lookup`] for the recognized variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is present but cannot be parsed, or if the resulting
    /// configuration does not pass [`Config::validate`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from the defaults, overridden by whatever `lookup` returns.
    ///
    /// The recognized keys are `ENCORE_TTL_MS`, `ENCORE_BACKGROUND_THRESHOLD_MS`,
    /// `ENCORE_MIN_REQUEST_INTERVAL_MS`, `ENCORE_MAX_RETRY_ATTEMPTS`, `ENCORE_SOFT_BACKOFF_BASE_MS`,
    /// `ENCORE_GENERIC_BACKOFF_BASE_MS`, `ENCORE_UPSTREAM_CALL_TIMEOUT_MS`, `ENCORE_REFRESH_TIMEOUT_MS`,
    /// `ENCORE_SOFT_BLOCK_PHRASES` and `ENCORE_PAYLOAD_BLOCK_PHRASES`. Phrase lists are comma-separated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value cannot be parsed, or if the resulting configuration
    /// does not pass [`Config::validate`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(value) = var("TTL_MS") {
            config.ttl_ms = parse_number("TTL_MS", &value)?;
        }
        if let Some(value) = var("BACKGROUND_THRESHOLD_MS") {
            config.background_threshold_ms = parse_number("BACKGROUND_THRESHOLD_MS", &value)?;
        }
        if let Some(value) = var("MIN_REQUEST_INTERVAL_MS") {
            config.min_request_interval_ms = parse_number("MIN_REQUEST_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = parse_number("MAX_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = var("SOFT_BACKOFF_BASE_MS") {
            config.soft_backoff_base_ms = parse_number("SOFT_BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = var("GENERIC_BACKOFF_BASE_MS") {
            config.generic_backoff_base_ms = parse_number("GENERIC_BACKOFF_BASE_MS", &value)?;
        }
        if let Some(value) = var("UPSTREAM_CALL_TIMEOUT_MS") {
            config.upstream_call_timeout_ms = parse_number("UPSTREAM_CALL_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("REFRESH_TIMEOUT_MS") {
            config.refresh_timeout_ms = Some(parse_number("REFRESH_TIMEOUT_MS", &value)?);
        }
        if let Some(value) = var("SOFT_BLOCK_PHRASES") {
            config.soft_block_phrases = parse_list(&value);
        }
        if let Some(value) = var("PAYLOAD_BLOCK_PHRASES") {
            config.payload_block_phrases = parse_list(&value);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that the knobs are consistent with each other.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TTL is zero, the background threshold is not below the
    /// TTL, no attempts are allowed, or one of the timeouts is zero.
    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(Error::Config("ttl must be greater than zero".to_string()));
        }
        if self.background_threshold_ms >= self.ttl_ms {
            return Err(Error::Config(format!(
                "background threshold ({} ms) must be below the ttl ({} ms)",
                self.background_threshold_ms, self.ttl_ms
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::Config("at least one attempt must be allowed".to_string()));
        }
        if self.upstream_call_timeout_ms == 0 {
            return Err(Error::Config("upstream call timeout must be greater than zero".to_string()));
        }
        if self.refresh_timeout_ms == Some(0) {
            return Err(Error::Config("refresh timeout must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Maximum age at which cached data is served without a blocking refresh.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Sets the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = millis(ttl);
        self
    }

    /// Age past which a fresh read also starts a background refresh.
    #[must_use]
    pub fn background_threshold(&self) -> Duration {
        Duration::from_millis(self.background_threshold_ms)
    }

    /// Sets the background refresh threshold.
    #[must_use]
    pub fn with_background_threshold(mut self, threshold: Duration) -> Self {
        self.background_threshold_ms = millis(threshold);
        self
    }

    /// Minimum spacing between two upstream calls.
    #[must_use]
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    /// Sets the minimum spacing between two upstream calls.
    #[must_use]
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval_ms = millis(interval);
        self
    }

    /// How many times a single upstream call is attempted.
    #[must_use]
    pub fn max_retry_attempts(&self) -> u32 {
        self.max_retry_attempts
    }

    /// Sets how many times a single upstream call is attempted.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Base of the exponential backoff applied after a soft-block.
    #[must_use]
    pub fn soft_backoff_base(&self) -> Duration {
        Duration::from_millis(self.soft_backoff_base_ms)
    }

    /// Sets the base of the soft-block backoff.
    #[must_use]
    pub fn with_soft_backoff_base(mut self, base: Duration) -> Self {
        self.soft_backoff_base_ms = millis(base);
        self
    }

    /// Base of the exponential backoff applied after any other failure.
    #[must_use]
    pub fn generic_backoff_base(&self) -> Duration {
        Duration::from_millis(self.generic_backoff_base_ms)
    }

    /// Sets the base of the generic backoff.
    #[must_use]
    pub fn with_generic_backoff_base(mut self, base: Duration) -> Self {
        self.generic_backoff_base_ms = millis(base);
        self
    }

    /// Upper bound on a single upstream call attempt.
    #[must_use]
    pub fn upstream_call_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_call_timeout_ms)
    }

    /// Sets the upper bound on a single upstream call attempt.
    #[must_use]
    pub fn with_upstream_call_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_call_timeout_ms = millis(timeout);
        self
    }

    /// Upper bound on a whole aggregation run; three times the TTL unless set explicitly.
    #[must_use]
    pub fn refresh_timeout(&self) -> Duration {
        self.refresh_timeout_ms
            .map_or_else(|| self.ttl().saturating_mul(3), Duration::from_millis)
    }

    /// Sets the upper bound on a whole aggregation run.
    #[must_use]
    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout_ms = Some(millis(timeout));
        self
    }

    /// Phrases that mark an upstream error message as a soft-block.
    #[must_use]
    pub fn soft_block_phrases(&self) -> &[String] {
        &self.soft_block_phrases
    }

    /// Sets the phrases that mark an upstream error message as a soft-block.
    #[must_use]
    pub fn with_soft_block_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.soft_block_phrases = phrases.into_iter().map(Into::into).collect();
        self
    }

    /// Phrases that mark an upstream response body, successful or not, as a soft-block.
    #[must_use]
    pub fn payload_block_phrases(&self) -> &[String] {
        &self.payload_block_phrases
    }

    /// Sets the phrases that mark an upstream response body as a soft-block.
    #[must_use]
    pub fn with_payload_block_phrases<I, S>(mut self, phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payload_block_phrases = phrases.into_iter().map(Into::into).collect();
        self
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{ENV_PREFIX}{name} is not a valid number: {value:?}")))
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|phrase| !phrase.is_empty())
        .map(ToString::to_string)
        .collect()
}
