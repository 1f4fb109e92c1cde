use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::UimError;

/// Core library version reported in `x-sdk-core-version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default API domain
pub const DEFAULT_DOMAIN: &str = "api.uimkit.chat";

/// Default OAuth token endpoint
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://uim.cn.authok.cn/oauth/token";

/// Default `source` attribute of outbound events
pub const DEFAULT_EVENT_SOURCE: &str = "uim.source";

/// Hard default read timeout, used when no layer configures one
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard default connect timeout, used when no layer configures one
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum response body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Default `User-Agent` prefix: `UIMKit (<os>; <arch>) Rust Core/<version>`.
pub static DEFAULT_USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "UIMKit ({}; {}) Rust Core/{VERSION}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

/// URL scheme used to reach the API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = UimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("https") {
            Ok(Self::Https)
        } else if s.eq_ignore_ascii_case("http") {
            Ok(Self::Http)
        } else {
            Err(UimError::invalid_config(format!(
                "unsupported scheme '{s}', expected http or https"
            )))
        }
    }
}

/// Exponential backoff between retry attempts
///
/// Computes delay as: `min(initial * multiplier^attempt, max)` with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Adds a random delay of 0-25% to each backoff (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    /// Fast backoff for testing (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Retry policy
///
/// Only transport failures and statuses >= 500 are ever retried, and only when
/// `auto_retry` is on. Attempts run strictly one after another.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Enables retrying (default: false)
    pub auto_retry: bool,

    /// Retries after the initial attempt (default: 3).
    /// Total attempts = 1 + `max_retries` when `auto_retry` is on.
    pub max_retries: u32,

    /// Delay between attempts; `None` retries immediately (default)
    pub backoff: Option<ExponentialBackoff>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: false,
            max_retries: 3,
            backoff: None,
        }
    }
}

impl RetryConfig {
    /// Retries enabled with the given budget
    #[must_use]
    pub fn enabled(max_retries: u32) -> Self {
        Self {
            auto_retry: true,
            max_retries,
            backoff: None,
        }
    }

    /// Effective retry budget: `max_retries` when enabled, otherwise 0.
    #[must_use]
    pub fn effective_max_retries(&self) -> u32 {
        if self.auto_retry { self.max_retries } else { 0 }
    }
}

/// Background dispatch queue sizing
#[derive(Debug, Clone)]
pub struct AsyncConfig {
    /// Start the queue when the client is built (default: false)
    pub enabled: bool,

    /// Queued tasks before `add_async_task` waits (default: 1000)
    pub queue_size: usize,

    /// Worker tasks draining the queue (default: 5)
    pub workers: usize,
}

impl Default for AsyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_size: 1000,
            workers: 5,
        }
    }
}

/// Explicit proxy settings.
///
/// Unset fields fall back to `HTTPS_PROXY`/`https_proxy`,
/// `HTTP_PROXY`/`http_proxy` and `NO_PROXY`/`no_proxy`. `Some("")` turns
/// the proxy off without consulting the environment.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Proxy for `http` destinations
    pub http_proxy: Option<String>,

    /// Proxy for `https` destinations
    pub https_proxy: Option<String>,

    /// Comma-separated hosts that bypass the proxy; `*.example.com` matches
    /// any subdomain
    pub no_proxy: Option<String>,
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Transport-level defaults, consulted after per-call and per-client values
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,

    /// Idle timeout for pooled connections (default: 90s)
    pub pool_idle_timeout: Option<Duration>,

    /// Maximum idle connections per host (default: 32)
    pub pool_max_idle_per_host: usize,

    pub tls_roots: TlsRootConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            connect_timeout: None,
            pool_idle_timeout: Some(Duration::from_secs(90)),
            pool_max_idle_per_host: 32,
            tls_roots: TlsRootConfig::default(),
        }
    }
}

/// OAuth client credentials exchanged for a bearer token
#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub audience: String,
}

impl Credentials {
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            audience: audience.into(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client credentials; required when `enable_authorization` is on
    pub credentials: Option<Credentials>,

    pub token_endpoint: String,

    /// Attach `authorization: Bearer <token>` to API calls (default: true)
    pub enable_authorization: bool,

    pub scheme: Scheme,
    pub domain: String,
    pub port: Option<u16>,
    pub base_path: String,

    /// Appended to the default user agent as ` Extra/<value>`
    pub user_agent: Option<String>,

    /// Per-client read timeout; `None` defers to `transport`
    pub read_timeout: Option<Duration>,
    /// Per-client connect timeout; `None` defers to `transport`
    pub connect_timeout: Option<Duration>,

    /// Skip TLS certificate verification (testing only)
    pub insecure: bool,

    pub proxy: ProxyConfig,
    pub transport: TransportConfig,
    pub retry: RetryConfig,
    pub async_queue: AsyncConfig,

    /// Log wire headers for every attempt. Also switched on by a `DEBUG`
    /// environment list containing `sdk`.
    pub debug: bool,

    /// Maximum response body size in bytes (default: 10 MiB)
    pub max_body_size: usize,

    /// Expected `X-UIM-Key` of inbound webhooks
    pub app_id: Option<String>,

    /// Shared HMAC secret of inbound webhooks
    pub webhook_secret: Option<SecretString>,

    /// `source` attribute of events sent by this client
    pub event_source: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            token_endpoint: DEFAULT_TOKEN_ENDPOINT.to_owned(),
            enable_authorization: true,
            scheme: Scheme::Https,
            domain: DEFAULT_DOMAIN.to_owned(),
            port: None,
            base_path: String::new(),
            user_agent: None,
            read_timeout: Some(DEFAULT_READ_TIMEOUT),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            insecure: false,
            proxy: ProxyConfig::default(),
            transport: TransportConfig::default(),
            retry: RetryConfig::default(),
            async_queue: AsyncConfig::default(),
            debug: false,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            app_id: None,
            webhook_secret: None,
            event_source: DEFAULT_EVENT_SOURCE.to_owned(),
        }
    }
}

impl ClientConfig {
    /// Configuration for tests against local mock servers: plain HTTP on
    /// `127.0.0.1`, no authorization, short timeouts, no proxy.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            enable_authorization: false,
            scheme: Scheme::Http,
            domain: "127.0.0.1".to_owned(),
            read_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(2)),
            proxy: ProxyConfig {
                http_proxy: Some(String::new()),
                https_proxy: Some(String::new()),
                no_proxy: None,
            },
            ..Default::default()
        }
    }

    /// Point the client at `base_url`, taking its scheme, host, port and
    /// path.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidConfig` if the URL does not parse, has no host or
    /// uses a scheme other than http/https.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, UimError> {
        let url = url::Url::parse(base_url)
            .map_err(|e| UimError::invalid_config(format!("invalid base url '{base_url}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| UimError::invalid_config(format!("base url '{base_url}' has no host")))?;

        self.scheme = url.scheme().parse()?;
        self.domain = host.to_owned();
        self.port = url.port();
        self.base_path = url.path().trim_end_matches('/').to_owned();
        Ok(self)
    }
}
