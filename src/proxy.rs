use std::sync::Arc;

use crate::{
    fetcher::{EnvironmentSource, FetchLimits, UpstreamFetcher, UpstreamFetcherConfig},
    CacheStore, ChangeNotifier, EnvironmentDocument, EnvironmentKey, Error, ProxyConfig, Refresher,
    RefresherConfig, RefresherHandle, Result, Subscription,
};

/// The environment cache of an edge proxy.
///
/// `EdgeProxy` is constructed once at startup and shared (by reference or `Arc`) with request
/// handlers. It owns the [`CacheStore`], the [`ChangeNotifier`] and the upstream client.
///
/// # Refresher
///
/// The cache stays empty until the refresher is started with [`EdgeProxy::start_refresher()`].
/// Requests before the first refresh fail with [`Error::NotYetFetched`], so it's recommended to
/// call [`RefresherHandle::wait_for_first_refresh()`] before serving traffic.
///
/// # Examples
/// ```no_run
/// # async fn run() -> edge_proxy::Result<()> {
/// # use edge_proxy::ProxyConfig;
/// let proxy = ProxyConfig::new("https://api.example.com/api/v1/", "api-token")
///     .environment_keys(["env-key"])
///     .to_proxy()?;
/// let refresher = proxy.start_refresher();
/// refresher.wait_for_first_refresh().await?;
///
/// let document = proxy.get_environment("env-key")?;
/// println!("{}", document.fingerprint);
///
/// // Returns only if the upstream became unreachable.
/// refresher.wait().await
/// # }
/// ```
pub struct EdgeProxy {
    store: Arc<CacheStore>,
    notifier: Arc<ChangeNotifier>,
    // Shared by every caller so that the in-flight guard covers all of them.
    refresher: Arc<Refresher>,
    config: ProxyConfig,
}

impl EdgeProxy {
    /// Create a new `EdgeProxy` fetching from the management API described by `config`.
    ///
    /// See [`ProxyConfig::to_proxy()`].
    pub fn new(config: ProxyConfig) -> Result<EdgeProxy> {
        let fetcher = UpstreamFetcher::new(UpstreamFetcherConfig {
            base_url: config.base_url.clone(),
            api_token: config.api_token.clone(),
            request_timeout: config.request_timeout,
        })?;
        Ok(EdgeProxy::with_source(config, Arc::new(fetcher)))
    }

    /// Create an `EdgeProxy` using a custom environment source instead of the management API.
    pub fn with_source(config: ProxyConfig, source: Arc<dyn EnvironmentSource>) -> EdgeProxy {
        let store = Arc::new(CacheStore::new(config.environment_keys.iter().cloned()));
        let notifier = Arc::new(ChangeNotifier::new(config.subscriber_capacity));
        let refresher = Arc::new(Refresher::new(
            source,
            store.clone(),
            notifier.clone(),
            FetchLimits {
                request_timeout: config.request_timeout,
                max_concurrency: config.max_concurrent_fetches,
            },
        ));
        EdgeProxy {
            store,
            notifier,
            refresher,
            config,
        }
    }

    /// Get the cached document of an environment.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownKey`] if `key` is not configured.
    /// - [`Error::NotYetFetched`] if the environment has not been fetched yet.
    pub fn get_environment(&self, key: &str) -> Result<Arc<EnvironmentDocument>> {
        self.store.get(key)
    }

    /// Subscribe to changes of all environments.
    pub fn subscribe(&self) -> Subscription {
        self.notifier.subscribe()
    }

    /// Subscribe to changes of a single environment.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownKey`] if `key` is not configured.
    pub fn subscribe_environment(&self, key: &str) -> Result<Subscription> {
        if !self.store.contains(key) {
            return Err(Error::UnknownKey(key.into()));
        }
        Ok(self.notifier.subscribe_environment(EnvironmentKey::from(key)))
    }

    /// Whether every configured environment holds a document.
    pub fn is_ready(&self) -> bool {
        self.store.fetched_count() == self.store.keys().count()
    }

    /// The underlying cache store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// The refresher of this proxy, for running cycles by hand.
    ///
    /// Every call returns the same refresher, so at most one cycle is in flight per proxy no
    /// matter how many callers or background tasks drive it.
    pub fn refresher(&self) -> Arc<Refresher> {
        self.refresher.clone()
    }

    /// Start refreshing the cache in a background task.
    ///
    /// Must be called within a tokio runtime. Keep the returned handle alive: dropping it stops
    /// the refresher.
    pub fn start_refresher(&self) -> RefresherHandle {
        RefresherHandle::spawn(
            self.refresher(),
            RefresherConfig::new()
                .with_interval(self.config.poll_interval)
                .with_max_total_failures(self.config.max_total_failures),
        )
    }
}
