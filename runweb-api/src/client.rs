use crate::cache::ResponseCache;
use crate::error::{ApiError, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "runweb/0.1 (https://github.com/runweb/runweb)";

/// Suspends the caller between retries. Injected so tests can count sleeps
/// without waiting on a real clock.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Fixed-interval retry policy for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub interval: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn allows(&self, retries_so_far: u32) -> bool {
        self.max_retries.is_none_or(|max| retries_so_far < max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Transient,
    NotFound,
}

/// Throttling (420/429) and server-side failures (5xx, gateway timeouts
/// included) are transient; every other client error is permanent.
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        420 | 429 => StatusClass::Transient,
        500..=599 => StatusClass::Transient,
        _ => StatusClass::NotFound,
    }
}

enum Attempt {
    Done { value: Value, status: u16, body: String },
    Retry(String),
}

/// HTTP client that consults the response cache first and retries
/// transient failures with a fixed backoff.
pub struct ApiClient {
    client: Client,
    base_url: Url,
    cache: Option<Arc<ResponseCache>>,
    backoff: BackoffPolicy,
    sleeper: Arc<dyn Sleeper>,
    api_key: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, DEFAULT_USER_AGENT, 30)
    }

    pub fn with_options(base_url: &str, user_agent: &str, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs.div_ceil(2)))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        // Url::join drops the last path segment unless the base ends with '/'
        let base = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url =
            Url::parse(&base).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base, e)))?;

        Ok(Self {
            client,
            base_url,
            cache: None,
            backoff: BackoffPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
            api_key: None,
        })
    }

    pub fn with_cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URIs are used as given, anything else is joined onto the base.
    pub fn resolve(&self, uri: &str) -> Result<Url> {
        match Url::parse(uri) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(uri.trim_start_matches('/'))
                .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", uri, e))),
            Err(e) => Err(ApiError::InvalidUrl(format!("{}: {}", uri, e))),
        }
    }

    /// Fetch `uri` and return its JSON envelope.
    ///
    /// Transient failures never reach the caller unless the backoff policy
    /// carries a retry cap. Permanent client errors surface as
    /// [`ApiError::NotFound`].
    pub async fn request(&self, uri: &str) -> Result<Value> {
        let url = self.resolve(uri)?;

        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(url.as_str())?
        {
            debug!(url = %url, "cache hit");
            return Ok(serde_json::from_str(&hit.body)?);
        }

        let mut retries = 0u32;
        loop {
            match self.attempt(&url).await? {
                Attempt::Done {
                    value,
                    status,
                    body,
                } => {
                    if let Some(cache) = &self.cache {
                        cache.put(url.as_str(), status, &body)?;
                    }
                    return Ok(value);
                }
                Attempt::Retry(reason) => {
                    if !self.backoff.allows(retries) {
                        return Err(ApiError::RetriesExhausted {
                            uri: url.to_string(),
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    warn!(
                        url = %url,
                        retry = retries,
                        "{}: re-requesting in {:?}",
                        reason,
                        self.backoff.interval
                    );
                    self.sleeper.sleep(self.backoff.interval).await;
                }
            }
        }
    }

    async fn attempt(&self, url: &Url) -> Result<Attempt> {
        debug!("Fetching {}", url);

        let mut request = self.client.get(url.clone());
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Ok(Attempt::Retry(format!("transport failure ({})", e)));
            }
            Err(e) => return Err(e.into()),
        };

        let status = response.status();
        match classify_status(status.as_u16()) {
            StatusClass::Success => {}
            StatusClass::Transient => {
                return Ok(Attempt::Retry(format!("({}) upstream busy", status)));
            }
            StatusClass::NotFound => {
                return Err(ApiError::NotFound {
                    status: status.as_u16(),
                    uri: url.to_string(),
                });
            }
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return Ok(Attempt::Retry(format!("({}) unreadable body: {}", status, e))),
        };

        match serde_json::from_str::<Value>(&body) {
            Ok(value) if value.get("data").is_some_and(|data| !data.is_null()) => {
                Ok(Attempt::Done {
                    value,
                    status: status.as_u16(),
                    body,
                })
            }
            Ok(_) => Ok(Attempt::Retry(format!("({}) response carried no data", status))),
            Err(e) => Ok(Attempt::Retry(format!("({}) malformed body: {}", status, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        fn count(&self) -> usize {
            self.sleeps.lock().unwrap().len()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            self.sleeps.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    fn client_for(server: &MockServer, sleeper: Arc<RecordingSleeper>) -> ApiClient {
        ApiClient::new(&server.uri())
            .unwrap()
            .with_backoff(BackoffPolicy::new(Duration::from_secs(3)))
            .with_sleeper(sleeper)
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(200), StatusClass::Success);
        assert_eq!(classify_status(420), StatusClass::Transient);
        assert_eq!(classify_status(429), StatusClass::Transient);
        assert_eq!(classify_status(504), StatusClass::Transient);
        assert_eq!(classify_status(404), StatusClass::NotFound);
        assert_eq!(classify_status(400), StatusClass::NotFound);
    }

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = ApiClient::new("https://example.com/api/v1").unwrap();
        assert_eq!(
            client.resolve("games/abc").unwrap().as_str(),
            "https://example.com/api/v1/games/abc"
        );
        assert_eq!(
            client.resolve("https://other.example.com/x?y=1").unwrap().as_str(),
            "https://other.example.com/x?y=1"
        );
    }

    /// A throttled response followed by a success yields one body and one sleep
    #[tokio::test]
    async fn test_throttle_then_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/games/abc"))
            .respond_with(ResponseTemplate::new(420))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/games/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "abc"}})))
            .mount(&mock_server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(&mock_server, sleeper.clone());

        let body = client.request("games/abc").await.unwrap();

        assert_eq!(body["data"]["id"], "abc");
        assert_eq!(sleeper.count(), 1);
        assert_eq!(sleeper.sleeps.lock().unwrap()[0], Duration::from_secs(3));
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_gateway_timeout_and_malformed_body_are_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(504))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>busy</html>"))
            .up_to_n_times(2)
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/users/u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "u1"}})))
            .mount(&mock_server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(&mock_server, sleeper.clone());

        let body = client.request("users/u1").await.unwrap();

        assert_eq!(body["data"]["id"], "u1");
        assert_eq!(sleeper.count(), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_terminal() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/games/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"status": 404})))
            .mount(&mock_server)
            .await;

        Mock::given(method("GET"))
            .and(path("/games/bad"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&mock_server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(&mock_server, sleeper.clone());

        let err = client.request("games/missing").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {}", err);

        let err = client.request("games/bad").await.unwrap_err();
        assert!(err.is_not_found(), "unexpected error: {}", err);

        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_retry_cap_gives_up() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/games/abc"))
            .respond_with(ResponseTemplate::new(420))
            .mount(&mock_server)
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = ApiClient::new(&mock_server.uri())
            .unwrap()
            .with_backoff(BackoffPolicy::new(Duration::from_millis(1)).with_max_retries(2))
            .with_sleeper(sleeper.clone());

        let err = client.request("games/abc").await.unwrap_err();

        assert!(matches!(err, ApiError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(sleeper.count(), 2);
        assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cached_response_skips_network() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/games/abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "abc"}})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let cache = Arc::new(ResponseCache::in_memory().unwrap());
        let client = ApiClient::new(&mock_server.uri())
            .unwrap()
            .with_cache(cache.clone());

        let first = client.request("games/abc").await.unwrap();
        let second = client.request("games/abc").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/games/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let cache = Arc::new(ResponseCache::in_memory().unwrap());
        let client = ApiClient::new(&mock_server.uri())
            .unwrap()
            .with_cache(cache.clone());

        assert!(client.request("games/missing").await.is_err());
        assert!(cache.is_empty().unwrap());
    }
}
