// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Any error that may arise while refreshing or serving the aggregate.
///
/// The type is `Clone` because a single refresh result is handed to every caller that joined the
/// in-flight refresh.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The upstream provider throttled the call or flagged it as automated traffic.
    ///
    /// This classification only exists for a single attempt inside
    /// [`RetryExecutor`][crate::RetryExecutor]; callers observe it as part of
    /// [`Error::UpstreamFatal`] once attempts are exhausted.
    #[error("upstream soft-blocked the call: {0}")]
    UpstreamSoftBlock(String),

    /// The upstream call failed for any other reason.
    ///
    /// Like [`Error::UpstreamSoftBlock`], this never escapes the retry executor on its own.
    #[error("upstream call failed: {0}")]
    UpstreamTransient(String),

    /// A single upstream call did not answer before the per-call timeout.
    ///
    /// Retried like [`Error::UpstreamTransient`].
    #[error("upstream call did not complete within {0:?}")]
    UpstreamTimeout(Duration),

    /// The upstream call returned successfully but the payload was not of the expected shape.
    #[error("upstream returned an invalid payload: {0}")]
    InvalidPayload(String),

    /// All attempts of an upstream call failed.
    #[error("upstream call failed after {attempts} attempt(s): {message}")]
    UpstreamFatal {
        /// How many attempts were made.
        attempts: u32,
        /// Whether the final attempt was soft-blocked.
        soft_blocked: bool,
        /// Description of the last failure.
        message: String,
    },

    /// The aggregator itself reported a failure that did not come from a single upstream call.
    #[error("aggregation failed: {0}")]
    Aggregation(String),

    /// The refresh did not finish before its deadline.
    #[error("refresh did not complete within {0:?}")]
    RefreshTimeout(Duration),

    /// The refresh task panicked or was torn down before producing a result.
    #[error("refresh was aborted before completing")]
    RefreshAborted,

    /// A refresh failed and there is no previously fetched aggregate to fall back on.
    #[error("no data available: {cause}")]
    NoDataAvailable {
        /// The refresh failure.
        #[source]
        cause: Arc<Self>,
    },

    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn no_data(cause: Self) -> Self {
        Self::NoDataAvailable { cause: Arc::new(cause) }
    }

    /// Returns `true` if the error is a soft-block, either for a single attempt or as the last
    /// failure of an exhausted call.
    #[must_use]
    pub fn is_soft_block(&self) -> bool {
        match self {
            Self::UpstreamSoftBlock(_) => true,
            Self::UpstreamFatal { soft_blocked, .. } => *soft_blocked,
            Self::NoDataAvailable { cause } => cause.is_soft_block(),
            _ => false,
        }
    }
}

/// A specialized `Result` for use with this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by a single call to the upstream content provider.
///
/// Besides the message, the error can carry the raw response body. Upstream error pages are
/// inspected for soft-block phrases even when the message itself is generic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProviderError {
    message: String,
    body: Option<String>,
}

impl ProviderError {
    /// Creates an error with the given message and no response body.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            body: None,
        }
    }

    /// Attaches the raw response body that accompanied the failure.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The raw response body, if the upstream sent one.
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }
}
