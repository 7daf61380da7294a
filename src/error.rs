use std::sync::Arc;

use reqwest::StatusCode;

use crate::EnvironmentKey;

/// Represents a result type for operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors of the environment cache.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The requested environment key is not in the configured allowlist.
    #[error("unknown environment key: {0}")]
    UnknownKey(EnvironmentKey),

    /// The key is valid but no document has been fetched for it yet.
    #[error("environment {0} has not been fetched yet")]
    NotYetFetched(EnvironmentKey),

    /// Fetching a single environment from upstream failed.
    ///
    /// The refresher never returns this: it keeps per-environment failures in
    /// [`RefreshReport::failed`](crate::RefreshReport::failed) and serves stale data instead. It is
    /// what a [`FetchError`] becomes when code calling an
    /// [`EnvironmentSource`](crate::fetcher::EnvironmentSource) directly propagates it with `?`.
    #[error(transparent)]
    Fetch(FetchError),

    /// Every configured environment failed to refresh in one cycle.
    #[error("refresh failed for all {} environments", failures.len())]
    TotalRefreshFailure {
        /// Per-key failures of the cycle.
        failures: Vec<FetchError>,
    },

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// HTTP client could not be constructed.
    #[error("failed to build http client")]
    HttpClient(#[source] Arc<reqwest::Error>),

    /// Indicates that the refresher task panicked. This should normally never happen.
    #[error("refresher task panicked")]
    RefresherPanicked,

    /// The refresher stopped before completing its first refresh.
    #[error("refresher stopped")]
    RefresherStopped,
}

impl Error {
    /// Returns `true` if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NotYetFetched(_) | Error::Fetch(_))
    }

    /// HTTP status code the read API should answer with for this error.
    pub fn status_hint(&self) -> StatusCode {
        match self {
            Error::UnknownKey(_) => StatusCode::NOT_FOUND,
            Error::NotYetFetched(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Fetch(_) | Error::TotalRefreshFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::InvalidBaseUrl(_)
            | Error::HttpClient(_)
            | Error::RefresherPanicked
            | Error::RefresherStopped => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<FetchError> for Error {
    fn from(value: FetchError) -> Self {
        Error::Fetch(value)
    }
}

/// Failure to fetch one environment document.
#[derive(thiserror::Error, Debug, Clone)]
#[error("failed to fetch environment {key}: {cause}")]
pub struct FetchError {
    /// Environment that failed.
    pub key: EnvironmentKey,
    /// What went wrong.
    #[source]
    pub cause: FetchErrorCause,
}

impl FetchError {
    pub(crate) fn new(key: EnvironmentKey, cause: impl Into<FetchErrorCause>) -> FetchError {
        FetchError {
            key,
            cause: cause.into(),
        }
    }
}

/// Normalized reason of a [`FetchError`].
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum FetchErrorCause {
    /// Transport-level failure.
    #[error("network error")]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(#[source] Arc<reqwest::Error>),

    /// Upstream answered with a non-success status.
    #[error("upstream responded with {0}")]
    Status(StatusCode),

    /// Response body is not a valid document.
    #[error("malformed response body")]
    Malformed(#[source] Arc<serde_json::Error>),

    /// The request did not complete within the per-request timeout.
    #[error("request timed out")]
    Timeout,
}

impl From<reqwest::Error> for FetchErrorCause {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return FetchErrorCause::Timeout;
        }
        FetchErrorCause::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for FetchErrorCause {
    fn from(value: serde_json::Error) -> Self {
        FetchErrorCause::Malformed(Arc::new(value))
    }
}
