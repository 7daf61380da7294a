use std::fmt;
use std::time::Duration;

use crate::{EdgeProxy, EnvironmentKey, RefresherConfig, Result};

/// Configuration for [`EdgeProxy`].
///
/// Read once at startup; none of the settings can change afterwards.
///
/// # Examples
/// ```
/// # use std::time::Duration;
/// # use edge_proxy::ProxyConfig;
/// let proxy = ProxyConfig::new("https://api.example.com/api/v1/", "api-token")
///     .environment_keys(["env-key-1", "env-key-2"])
///     .poll_interval(Duration::from_secs(30))
///     .to_proxy()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ProxyConfig {
    pub(crate) base_url: String,
    pub(crate) api_token: String,
    pub(crate) environment_keys: Vec<EnvironmentKey>,
    pub(crate) poll_interval: Duration,
    pub(crate) max_total_failures: u32,
    pub(crate) request_timeout: Duration,
    pub(crate) max_concurrent_fetches: usize,
    pub(crate) subscriber_capacity: usize,
}

impl ProxyConfig {
    /// Default interval between refreshes.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
    /// Default timeout of a single upstream request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default limit of concurrent upstream requests.
    pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 8;
    /// Default capacity of a subscriber's event queue.
    pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 32;

    /// Create a default configuration for the management API at `base_url`, authenticated with
    /// `api_token`.
    ///
    /// ```
    /// # use edge_proxy::ProxyConfig;
    /// ProxyConfig::new("https://api.example.com/api/v1/", "api-token");
    /// ```
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        ProxyConfig {
            base_url: base_url.into(),
            api_token: api_token.into(),
            environment_keys: Vec::new(),
            poll_interval: ProxyConfig::DEFAULT_POLL_INTERVAL,
            max_total_failures: RefresherConfig::DEFAULT_MAX_TOTAL_FAILURES,
            request_timeout: ProxyConfig::DEFAULT_REQUEST_TIMEOUT,
            max_concurrent_fetches: ProxyConfig::DEFAULT_MAX_CONCURRENT_FETCHES,
            subscriber_capacity: ProxyConfig::DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    /// Set the allowlist of environment keys to cache. Duplicates are ignored.
    pub fn environment_keys<K: Into<EnvironmentKey>>(
        mut self,
        keys: impl IntoIterator<Item = K>,
    ) -> Self {
        self.environment_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Override the refresh interval.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of consecutive refresh cycles failing for every environment that are tolerated
    /// before the refresher gives up. Defaults to 1: the first such cycle is fatal.
    pub fn max_total_failures(mut self, max_total_failures: u32) -> Self {
        self.max_total_failures = max_total_failures.max(1);
        self
    }

    /// Override the timeout of a single upstream request.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Override the maximum number of concurrent upstream requests.
    pub fn max_concurrent_fetches(mut self, max_concurrent_fetches: usize) -> Self {
        self.max_concurrent_fetches = max_concurrent_fetches.max(1);
        self
    }

    /// Override the number of events buffered per subscriber before it is disconnected.
    pub fn subscriber_capacity(mut self, subscriber_capacity: usize) -> Self {
        self.subscriber_capacity = subscriber_capacity.max(1);
        self
    }

    /// Create a new [`EdgeProxy`] using the specified configuration.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`](crate::Error::InvalidBaseUrl) if the base URL is invalid.
    /// - [`Error::HttpClient`](crate::Error::HttpClient) if the HTTP client cannot be built.
    pub fn to_proxy(self) -> Result<EdgeProxy> {
        EdgeProxy::new(self)
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .field("environment_keys", &self.environment_keys)
            .field("poll_interval", &self.poll_interval)
            .field("max_total_failures", &self.max_total_failures)
            .field("request_timeout", &self.request_timeout)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .field("subscriber_capacity", &self.subscriber_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ProxyConfig;
    use crate::Error;

    #[test]
    fn defaults() {
        let config = ProxyConfig::new("https://api.example.com/api/v1/", "token");

        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.max_total_failures, 1);
        assert!(config.environment_keys.is_empty());
    }

    #[test]
    fn limits_are_clamped() {
        let config = ProxyConfig::new("https://api.example.com/api/v1/", "token")
            .max_concurrent_fetches(0)
            .subscriber_capacity(0)
            .max_total_failures(0);

        assert_eq!(config.max_concurrent_fetches, 1);
        assert_eq!(config.subscriber_capacity, 1);
        assert_eq!(config.max_total_failures, 1);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let result = ProxyConfig::new("::not a url::", "token").to_proxy();

        assert!(matches!(result, Err(Error::InvalidBaseUrl(_))));
    }

    #[test]
    fn debug_output_hides_api_token() {
        let config = ProxyConfig::new("https://api.example.com/api/v1/", "secret-token");

        let output = format!("{config:?}");
        assert!(!output.contains("secret-token"), "{output}");
        assert!(output.contains("api.example.com"), "{output}");
    }
}
