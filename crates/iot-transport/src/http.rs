//! HTTP transport: JSON-RPC over POST, legacy GET paths, retry with
//! exponential backoff, and Basic/Digest authentication.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE},
};
use serde::Deserialize;
use serde_json::value::RawValue;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    auth::{AuthScheme, Credentials, DigestChallenge, basic_authorization},
    error::{TransportError, TransportResult},
    reconnect::BackoffConfig,
    transport::{MetricsCounters, Request, RpcError, Transport, TransportMetrics, with_deadline},
};

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Device base URL, e.g. `http://192.168.1.20`
    pub base_url: String,

    /// Per-attempt request timeout
    pub timeout: Duration,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Pool idle timeout
    pub pool_idle_timeout: Duration,

    /// Idle connections kept per host
    pub max_idle_per_host: usize,

    /// User agent string
    pub user_agent: String,

    /// Default headers to include with all requests
    pub default_headers: HashMap<String, String>,

    /// Accept invalid TLS certificates
    pub insecure_tls: bool,

    /// Retries after the initial attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub retry_delay: Duration,

    /// Backoff multiplier between retries
    pub retry_multiplier: f64,

    /// Upper bound for a single backoff delay
    pub max_retry_delay: Duration,

    pub auth: AuthScheme,

    /// Endpoint RPC envelopes are POSTed to
    pub rpc_path: String,
}

impl HttpConfig {
    /// Create a new HTTP configuration with defaults.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            pool_idle_timeout: Duration::from_secs(90),
            max_idle_per_host: 10,
            user_agent: concat!("iot-transport/", env!("CARGO_PKG_VERSION")).to_string(),
            default_headers: HashMap::new(),
            insecure_tls: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            retry_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
            auth: AuthScheme::None,
            rpc_path: "/rpc".to_string(),
        }
    }

    /// Create a builder for the HTTP configuration.
    pub fn builder(base_url: impl Into<String>) -> HttpConfigBuilder {
        HttpConfigBuilder::new(base_url)
    }

    /// Backoff schedule used between retries.
    pub fn retry_backoff(&self) -> BackoffConfig {
        BackoffConfig::exponential(self.retry_delay, self.retry_multiplier, self.max_retry_delay)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TransportResult<()> {
        if self.base_url.is_empty() {
            return Err(TransportError::config("Base URL cannot be empty"));
        }

        let url = url::Url::parse(&self.base_url)
            .map_err(|e| TransportError::config(format!("Invalid base URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransportError::config(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }

        if self.timeout.is_zero() {
            return Err(TransportError::config("Timeout cannot be zero"));
        }

        if !self.rpc_path.starts_with('/') {
            return Err(TransportError::config("RPC path must start with '/'"));
        }

        if self.max_retries > 0 {
            self.retry_backoff().validate().map_err(TransportError::config)?;
        }

        Ok(())
    }
}

/// Builder for HTTP configuration.
pub struct HttpConfigBuilder {
    config: HttpConfig,
}

impl HttpConfigBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: HttpConfig::new(base_url),
        }
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn max_idle_per_host(mut self, max: usize) -> Self {
        self.config.max_idle_per_host = max;
        self
    }

    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a default header.
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.config.insecure_tls = insecure;
        self
    }

    /// Retry up to `max_retries` times, starting at `base_delay`.
    #[must_use]
    pub fn retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.config.max_retries = max_retries;
        self.config.retry_delay = base_delay;
        self
    }

    #[must_use]
    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = AuthScheme::Basic(Credentials::new(username, password));
        self
    }

    #[must_use]
    pub fn digest_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.auth = AuthScheme::Digest(Credentials::new(username, password));
        self
    }

    #[must_use]
    pub fn rpc_path(mut self, path: impl Into<String>) -> Self {
        self.config.rpc_path = path.into();
        self
    }

    pub fn build(self) -> TransportResult<HttpConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Resolved target of one HTTP attempt.
#[derive(Debug, Clone)]
struct Target {
    method: Method,
    url: String,
    /// Request-target used in the digest computation.
    uri: String,
    body: Option<Bytes>,
    rpc: bool,
}

/// Request/response transport over pooled HTTP connections.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpConfig,
    metrics: MetricsCounters,
    closed: AtomicBool,
    /// Flipped by `close` to abort in-flight calls.
    close_signal: watch::Sender<bool>,
}

impl Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.config.base_url)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl HttpTransport {
    /// Create a transport with its own connection pool.
    pub fn new(config: HttpConfig) -> TransportResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(config.pool_idle_timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .user_agent(&config.user_agent)
            .default_headers(header_map(&config.default_headers)?)
            .danger_accept_invalid_certs(config.insecure_tls)
            .build()
            .map_err(|e| TransportError::Config {
                message: format!("Failed to build client: {e}"),
            })?;

        Ok(Self::from_parts(config, client))
    }

    /// Create a transport that shares a caller-supplied client.
    ///
    /// Timeouts, headers and TLS settings of `client` take precedence over
    /// the corresponding config fields.
    pub fn with_client(config: HttpConfig, client: reqwest::Client) -> TransportResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, client))
    }

    fn from_parts(config: HttpConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            config,
            metrics: MetricsCounters::default(),
            closed: AtomicBool::new(false),
            close_signal: watch::Sender::new(false),
        }
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn target(&self, request: &Request) -> TransportResult<Target> {
        let base = self.config.base_url.trim_end_matches('/');
        if request.is_rpc_method() {
            let uri = self.config.rpc_path.clone();
            Ok(Target {
                method: Method::POST,
                url: format!("{base}{uri}"),
                uri,
                body: Some(Bytes::from(request.to_envelope(None, None)?)),
                rpc: true,
            })
        } else {
            let uri = if request.method.starts_with('/') {
                request.method.clone()
            } else {
                format!("/{}", request.method)
            };
            Ok(Target {
                method: Method::GET,
                url: format!("{base}{uri}"),
                uri,
                body: None,
                rpc: false,
            })
        }
    }

    async fn send(
        &self,
        target: &Target,
        authorization: Option<&str>,
    ) -> TransportResult<reqwest::Response> {
        let mut builder = self.client.request(target.method.clone(), &target.url);
        if let Some(body) = &target.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }
        Ok(builder.send().await?)
    }

    /// Send with the configured authentication scheme.
    async fn send_authenticated(&self, target: &Target) -> TransportResult<reqwest::Response> {
        match &self.config.auth {
            AuthScheme::None => self.send(target, None).await,
            AuthScheme::Basic(credentials) => {
                let value = basic_authorization(credentials);
                self.send(target, Some(&value)).await
            }
            AuthScheme::Digest(credentials) => {
                let probe = self.send(target, None).await?;
                if probe.status() != StatusCode::UNAUTHORIZED {
                    return Ok(probe);
                }

                let header = probe
                    .headers()
                    .get_all(WWW_AUTHENTICATE)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .find(|v| v.trim_start().to_ascii_lowercase().starts_with("digest"))
                    .ok_or_else(|| TransportError::auth("401 without a digest challenge"))?;
                let challenge = DigestChallenge::parse(header)?;
                debug!(realm = %challenge.realm, algorithm = challenge.algorithm.as_str(), "answering digest challenge");

                let value = challenge.authorization(credentials, target.method.as_str(), &target.uri);
                self.send(target, Some(&value)).await
            }
        }
    }

    /// One attempt, without retry.
    async fn do_call(&self, request: &Request) -> TransportResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }

        let target = self.target(request)?;
        debug!(method = %request.method, url = %target.url, "sending request");

        let response = self.send_authenticated(&target).await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.as_u16() >= 400 {
            let text = String::from_utf8_lossy(&body).into_owned();
            return Err(TransportError::from_status(status, text));
        }

        if target.rpc {
            decode_rpc_body(body)
        } else {
            Ok(body)
        }
    }

    async fn call_with_retry(&self, request: &Request) -> TransportResult<Bytes> {
        let backoff = self.config.retry_backoff();
        let mut attempt = 0u32;

        loop {
            let err = match self.do_call(request).await {
                Ok(body) => return Ok(body),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                return Err(TransportError::MaxRetriesExceeded {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }

            let delay = backoff.delay(attempt);
            warn!(
                method = %request.method,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "request failed, retrying"
            );
            self.metrics.record_retry();
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: Request) -> TransportResult<Bytes> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut closing = self.close_signal.subscribe();
        let result = tokio::select! {
            result = with_deadline(request.timeout, self.call_with_retry(&request)) => result,
            _ = closing.wait_for(|closed| *closed) => Err(TransportError::Closed),
        };
        self.metrics.record(&result);
        result
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.send_replace(true);
            debug!(base_url = %self.config.base_url, "http transport closed");
        }
        Ok(())
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.snapshot()
    }
}

fn header_map(headers: &HashMap<String, String>) -> TransportResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::config(format!("Invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::config(format!("Invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Unwrap an RPC response envelope; bodies that are not envelopes pass
/// through untouched.
fn decode_rpc_body(body: Bytes) -> TransportResult<Bytes> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(default)]
        result: Option<Box<RawValue>>,
        #[serde(default)]
        error: Option<RpcError>,
    }

    match serde_json::from_slice::<Envelope>(&body) {
        Ok(Envelope {
            error: Some(error), ..
        }) => Err(error.into()),
        Ok(Envelope {
            result: Some(result),
            ..
        }) => Ok(Bytes::from(result.get().to_owned())),
        _ => Ok(body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HttpConfig::new("http://192.168.1.20");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(100));
        assert_eq!(config.retry_multiplier, 2.0);
        assert_eq!(config.rpc_path, "/rpc");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        assert!(HttpConfig::builder("").build().is_err());
        assert!(HttpConfig::builder("not a url").build().is_err());
        assert!(HttpConfig::builder("ftp://device").build().is_err());
        assert!(
            HttpConfig::builder("http://device")
                .timeout(Duration::ZERO)
                .build()
                .is_err()
        );
        assert!(
            HttpConfig::builder("http://device")
                .rpc_path("rpc")
                .build()
                .is_err()
        );
        let err = HttpConfig::builder("http://device")
            .retry_multiplier(0.5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Backoff factor"));
    }

    #[test]
    fn test_zero_retries_skip_backoff_validation() {
        let config = HttpConfig::builder("http://device")
            .retry(0, Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.max_retries, 0);

        assert!(
            HttpConfig::builder("http://device")
                .retry(1, Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_builder_sets_auth_and_retry() {
        let config = HttpConfig::builder("http://device")
            .digest_auth("admin", "password")
            .retry(5, Duration::from_millis(20))
            .default_header("X-Test", "1")
            .build()
            .unwrap();

        assert!(matches!(config.auth, AuthScheme::Digest(ref c) if c.username == "admin"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_backoff().delay(1), Duration::from_millis(40));
    }

    #[test]
    fn test_request_targets() {
        let transport = HttpTransport::new(HttpConfig::new("http://device/")).unwrap();

        let rpc = transport
            .target(&Request::new("Switch.GetStatus").params(&serde_json::json!({"id": 0})).unwrap())
            .unwrap();
        assert_eq!(rpc.method, Method::POST);
        assert_eq!(rpc.url, "http://device/rpc");
        assert_eq!(rpc.uri, "/rpc");
        assert!(rpc.body.is_some());

        let legacy = transport.target(&Request::new("/relay/0?turn=on")).unwrap();
        assert_eq!(legacy.method, Method::GET);
        assert_eq!(legacy.url, "http://device/relay/0?turn=on");
        assert!(legacy.body.is_none());
    }

    #[test]
    fn test_decode_rpc_body() {
        let body = Bytes::from_static(br#"{"id":1,"src":"dev","result":{"output":true}}"#);
        assert_eq!(decode_rpc_body(body).unwrap(), Bytes::from_static(br#"{"output":true}"#));

        let body = Bytes::from_static(br#"{"id":1,"error":{"code":-103,"message":"bad"}}"#);
        assert!(matches!(
            decode_rpc_body(body),
            Err(TransportError::Rpc { code: -103, .. })
        ));

        let body = Bytes::from_static(br#"{"ison":true}"#);
        assert_eq!(decode_rpc_body(body.clone()).unwrap(), body);
    }

    #[test]
    fn test_invalid_default_header_is_config_error() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(header_map(&headers), Err(TransportError::Config { .. })));
    }

    #[tokio::test]
    async fn test_call_after_close() {
        let transport = HttpTransport::new(HttpConfig::new("http://127.0.0.1:9")).unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert!(matches!(
            transport.call(Request::new("Shelly.GetStatus")).await,
            Err(TransportError::Closed)
        ));
    }
}
