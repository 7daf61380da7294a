//! An HTTP client that fetches environment documents from the upstream management API.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{header, StatusCode, Url};

use crate::{EnvironmentDocument, EnvironmentKey, Error, FetchError, FetchErrorCause, Result};

const DOCUMENT_ENDPOINT: &str = "environment-document/";
const ENVIRONMENT_KEY_HEADER: &str = "X-Environment-Key";

/// Something that can produce the current document of a single environment.
///
/// [`UpstreamFetcher`] is the production implementation.
#[async_trait]
pub trait EnvironmentSource: Send + Sync {
    /// Fetch the latest document for `key`.
    async fn fetch_environment(
        &self,
        key: &EnvironmentKey,
    ) -> std::result::Result<EnvironmentDocument, FetchError>;
}

/// Limits applied to a batch fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    /// Upper bound for a single environment fetch.
    pub request_timeout: Duration,
    /// Maximum number of fetches in flight.
    pub max_concurrency: usize,
}

/// Outcome of [`fetch_all`]. Every requested key ends up in exactly one of the two fields.
#[derive(Debug, Default)]
pub struct FetchResults {
    /// Successfully fetched documents.
    pub documents: HashMap<EnvironmentKey, EnvironmentDocument>,
    /// Keys that failed, with reasons.
    pub failures: Vec<FetchError>,
}

/// Fetch all `keys` from `source`, independently of each other.
///
/// A failure for one key never affects the others. Each fetch is bounded by
/// `limits.request_timeout` and at most `limits.max_concurrency` run at once.
pub async fn fetch_all<S>(source: &S, keys: &[EnvironmentKey], limits: FetchLimits) -> FetchResults
where
    S: EnvironmentSource + ?Sized,
{
    let fetches = stream::iter(keys.iter().cloned()).map(|key| async move {
        let result = match tokio::time::timeout(
            limits.request_timeout,
            source.fetch_environment(&key),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(FetchError::new(key.clone(), FetchErrorCause::Timeout)),
        };
        (key, result)
    });

    let mut results = FetchResults::default();
    let mut completed = fetches.buffer_unordered(limits.max_concurrency.max(1));
    while let Some((key, result)) = completed.next().await {
        match result {
            Ok(document) => {
                results.documents.insert(key, document);
            }
            Err(err) => results.failures.push(err),
        }
    }
    results
}

/// Configuration for [`UpstreamFetcher`].
#[derive(Clone)]
pub struct UpstreamFetcherConfig {
    /// Base URL of the management API, e.g. `https://api.example.com/api/v1/`.
    pub base_url: String,
    /// Bearer token used to authenticate against the management API.
    pub api_token: String,
    /// Timeout of a single request.
    pub request_timeout: Duration,
}

/// A client that fetches environment documents from the management API.
pub struct UpstreamFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    api_token: String,
}

impl UpstreamFetcher {
    /// Create a new fetcher.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBaseUrl`] if `base_url` cannot be parsed.
    /// - [`Error::HttpClient`] if the HTTP client cannot be initialized.
    pub fn new(config: UpstreamFetcherConfig) -> Result<UpstreamFetcher> {
        let url = document_url(&config.base_url)?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("edge-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| Error::HttpClient(err.into()))?;

        Ok(UpstreamFetcher {
            client,
            url,
            api_token: config.api_token,
        })
    }
}

#[async_trait]
impl EnvironmentSource for UpstreamFetcher {
    async fn fetch_environment(
        &self,
        key: &EnvironmentKey,
    ) -> std::result::Result<EnvironmentDocument, FetchError> {
        log::debug!(target: "edge_proxy", key = key; "fetching environment document");

        let response = self
            .client
            .get(self.url.clone())
            .header(ENVIRONMENT_KEY_HEADER, key.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_token))
            .send()
            .await
            .map_err(|err| FetchError::new(key.clone(), err))?;

        let status = response.status();
        if !status.is_success() {
            if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
                log::warn!(target: "edge_proxy", key = key; "upstream rejected credentials. Check the API token and environment key");
            }
            return Err(FetchError::new(key.clone(), FetchErrorCause::Status(status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::new(key.clone(), err))?;
        let document = EnvironmentDocument::from_wire_json(&body)
            .map_err(|err| FetchError::new(key.clone(), err))?;

        log::debug!(target: "edge_proxy", key = key, fingerprint = document.fingerprint.as_str(); "successfully fetched environment document");

        Ok(document)
    }
}

/// Resolve the document endpoint against `base_url`, tolerating a missing trailing slash.
fn document_url(base_url: &str) -> Result<Url> {
    let mut base = Url::parse(base_url).map_err(Error::InvalidBaseUrl)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(DOCUMENT_ENDPOINT).map_err(Error::InvalidBaseUrl)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::StatusCode;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{
        document_url, fetch_all, EnvironmentSource, FetchLimits, UpstreamFetcher,
        UpstreamFetcherConfig,
    };
    use crate::{
        EnvironmentDocument, EnvironmentKey, Error, FetchError, FetchErrorCause, Fingerprint,
    };

    fn fetcher(server: &MockServer) -> UpstreamFetcher {
        UpstreamFetcher::new(UpstreamFetcherConfig {
            base_url: format!("{}/api/v1", server.uri()),
            api_token: "secret".to_owned(),
            request_timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[test]
    fn document_url_handles_trailing_slash() {
        assert_eq!(
            document_url("https://api.example.com/api/v1").unwrap().as_str(),
            "https://api.example.com/api/v1/environment-document/"
        );
        assert_eq!(
            document_url("https://api.example.com/api/v1/").unwrap().as_str(),
            "https://api.example.com/api/v1/environment-document/"
        );
        assert!(matches!(
            document_url("not a url"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn fetches_document_with_credentials() {
        let server = MockServer::start().await;
        let body = r#"{"api_key":"envA","feature_states":[]}"#;
        Mock::given(method("GET"))
            .and(path("/api/v1/environment-document/"))
            .and(header("X-Environment-Key", "envA"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;

        let document = fetcher(&server)
            .fetch_environment(&"envA".into())
            .await
            .unwrap();

        assert_eq!(document.contents["api_key"], "envA");
        assert_eq!(document.fingerprint, Fingerprint::of_bytes(body));
    }

    #[tokio::test]
    async fn non_success_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_environment(&"envA".into())
            .await
            .unwrap_err();

        assert_eq!(err.key.as_str(), "envA");
        assert!(matches!(
            err.cause,
            FetchErrorCause::Status(StatusCode::UNAUTHORIZED)
        ));
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = fetcher(&server)
            .fetch_environment(&"envA".into())
            .await
            .unwrap_err();

        assert!(matches!(err.cause, FetchErrorCause::Malformed(_)));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_network_error() {
        let fetcher = UpstreamFetcher::new(UpstreamFetcherConfig {
            // Port 9 (discard) is not expected to accept HTTP connections.
            base_url: "http://127.0.0.1:9/api/v1".to_owned(),
            api_token: "secret".to_owned(),
            request_timeout: Duration::from_secs(2),
        })
        .unwrap();

        let err = fetcher.fetch_environment(&"envA".into()).await.unwrap_err();

        assert!(matches!(
            err.cause,
            FetchErrorCause::Network(_) | FetchErrorCause::Timeout
        ));
    }

    #[tokio::test]
    async fn fetch_all_isolates_failures() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("X-Environment-Key", "good"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("X-Environment-Key", "bad"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let keys: Vec<EnvironmentKey> = vec!["good".into(), "bad".into()];
        let results = fetch_all(
            &fetcher(&server),
            &keys,
            FetchLimits {
                request_timeout: Duration::from_secs(2),
                max_concurrency: 2,
            },
        )
        .await;

        assert_eq!(results.documents.len(), 1);
        assert!(results.documents.contains_key("good"));
        assert_eq!(results.failures.len(), 1);
        assert_eq!(results.failures[0].key.as_str(), "bad");
    }

    #[tokio::test]
    async fn fetch_all_times_out_slow_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{}")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let keys: Vec<EnvironmentKey> = vec!["slow".into()];
        let results = fetch_all(
            &fetcher(&server),
            &keys,
            FetchLimits {
                request_timeout: Duration::from_millis(100),
                max_concurrency: 1,
            },
        )
        .await;

        assert!(results.documents.is_empty());
        assert!(matches!(results.failures[0].cause, FetchErrorCause::Timeout));
    }

    struct CountingSource {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl EnvironmentSource for CountingSource {
        async fn fetch_environment(
            &self,
            _key: &EnvironmentKey,
        ) -> Result<EnvironmentDocument, FetchError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(EnvironmentDocument::from_wire_json(b"{}").unwrap())
        }
    }

    #[tokio::test]
    async fn fetch_all_bounds_concurrency() {
        let source = CountingSource {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        };
        let keys: Vec<EnvironmentKey> = (0..10).map(|i| format!("env{i}").into()).collect();

        let results = fetch_all(
            &source,
            &keys,
            FetchLimits {
                request_timeout: Duration::from_secs(1),
                max_concurrency: 3,
            },
        )
        .await;

        assert_eq!(results.documents.len(), 10);
        assert!(source.max_in_flight.load(Ordering::SeqCst) <= 3);
    }
}
