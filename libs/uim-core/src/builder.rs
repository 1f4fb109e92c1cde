use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use parking_lot::RwLock;
use secrecy::SecretString;

use crate::client::{Client, ClientInner};
use crate::config::{
    AsyncConfig, ClientConfig, Credentials, ExponentialBackoff, ProxyConfig, RetryConfig, Scheme,
    TlsRootConfig,
};
use crate::error::UimError;
use crate::event::EventRouter;
use crate::logger::{RequestLogger, TracingLogger};
use crate::queue::DispatchQueue;
use crate::request::CallOverrides;
use crate::token::{ClientCredentialsSource, TokenCache, TokenSource};
use crate::transport::{ProxySettings, TimeoutPolicy, TransportKey, TransportPool};
use crate::webhook::WebhookVerifier;

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
    logger: Option<Arc<dyn RequestLogger>>,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("custom_logger", &self.logger.is_some())
            .field("custom_token_source", &self.token_source.is_some())
            .finish()
    }
}

impl ClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            logger: None,
            token_source: None,
        }
    }

    /// Client credentials exchanged for the bearer token
    #[must_use]
    pub fn credentials(
        mut self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        self.config.credentials = Some(Credentials::new(client_id, client_secret, audience));
        self
    }

    #[must_use]
    pub fn token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.token_endpoint = endpoint.into();
        self
    }

    /// Attach a bearer token to API calls (default: true)
    #[must_use]
    pub fn enable_authorization(mut self, enabled: bool) -> Self {
        self.config.enable_authorization = enabled;
        self
    }

    /// Replace the client-credentials exchange with another token issuer
    #[must_use]
    pub fn token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    #[must_use]
    pub fn scheme(mut self, scheme: Scheme) -> Self {
        self.config.scheme = scheme;
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.config.domain = domain.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    #[must_use]
    pub fn base_path(mut self, base_path: impl Into<String>) -> Self {
        self.config.base_path = base_path.into();
        self
    }

    /// Take scheme, domain, port and base path from `base_url`
    ///
    /// # Errors
    /// Returns `SDK.InvalidConfig` if the URL is unusable
    pub fn base_url(mut self, base_url: &str) -> Result<Self, UimError> {
        self.config = self.config.with_base_url(base_url)?;
        Ok(self)
    }

    /// Appended to the default user agent as ` Extra/<value>`
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Read timeout of each attempt, covering the response head and body
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Skip TLS certificate verification
    ///
    /// **WARNING**: for local testing only.
    #[must_use]
    pub fn insecure(mut self, insecure: bool) -> Self {
        self.config.insecure = insecure;
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.transport.tls_roots = roots;
        self
    }

    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = proxy;
        self
    }

    #[must_use]
    pub fn http_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy.http_proxy = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn https_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.config.proxy.https_proxy = Some(proxy.into());
        self
    }

    #[must_use]
    pub fn no_proxy(mut self, no_proxy: impl Into<String>) -> Self {
        self.config.proxy.no_proxy = Some(no_proxy.into());
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Retry transport failures and statuses >= 500 up to `max_retries` times
    #[must_use]
    pub fn auto_retry(mut self, max_retries: u32) -> Self {
        self.config.retry.auto_retry = true;
        self.config.retry.max_retries = max_retries;
        self
    }

    /// Delay between retries (default: none)
    #[must_use]
    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.config.retry.backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn async_queue(mut self, config: AsyncConfig) -> Self {
        self.config.async_queue = config;
        self
    }

    /// Log wire headers and bodies of every attempt
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Set the maximum response body size
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// App id and shared secret used to verify inbound webhooks
    #[must_use]
    pub fn webhook(mut self, app_id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.config.app_id = Some(app_id.into());
        self.config.webhook_secret = Some(SecretString::from(secret.into()));
        self
    }

    /// `source` attribute of events sent by the client
    #[must_use]
    pub fn event_source(mut self, source: impl Into<String>) -> Self {
        self.config.event_source = source.into();
        self
    }

    /// Set the idle connection timeout for the connection pool
    ///
    /// Set to `None` to keep idle connections indefinitely.
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.transport.pool_idle_timeout = timeout;
        self
    }

    /// Set the maximum number of idle connections per host
    #[must_use]
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.transport.pool_max_idle_per_host = max;
        self
    }

    /// Receive one record per attempt instead of the default
    /// [`TracingLogger`]
    #[must_use]
    pub fn logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the client
    ///
    /// # Errors
    /// Returns `SDK.InvalidConfig` if the configuration is unusable:
    /// authorization without credentials, an unparsable proxy, token
    /// endpoint or no-proxy list, TLS initialization failure, or an async
    /// queue that cannot start
    pub fn build(self) -> Result<Client, UimError> {
        let config = self.config;

        if config.domain.is_empty() {
            return Err(UimError::invalid_config("domain must not be empty"));
        }
        if config.max_body_size == 0 {
            return Err(UimError::invalid_config("max_body_size must be positive"));
        }
        if config.insecure {
            tracing::warn!(
                "TLS certificate verification disabled for all calls; use only for testing"
            );
        }

        let proxy = ProxySettings::from_config(&config.proxy)?;
        let client_timeouts = TimeoutPolicy::resolve(&CallOverrides::default(), &config);
        let pool = TransportPool::new(config.transport.clone(), client_timeouts.connect);

        let tokens = if config.enable_authorization {
            let source = match self.token_source {
                Some(source) => source,
                None => client_credentials_source(&config, &proxy, &pool)?,
            };
            Some(TokenCache::new(source))
        } else {
            None
        };

        let webhook = match (&config.app_id, &config.webhook_secret) {
            (Some(app_id), Some(secret)) => {
                Some(WebhookVerifier::new(app_id.clone(), secret.clone()))
            }
            _ => None,
        };

        let logger = self
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger::from_env(config.debug)));

        let queue = DispatchQueue::new();
        if config.async_queue.enabled {
            queue.enable(&config.async_queue)?;
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                config,
                proxy,
                pool,
                logger,
                tokens,
                webhook,
                router: RwLock::new(EventRouter::new()),
                queue,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn client_credentials_source(
    config: &ClientConfig,
    proxy: &ProxySettings,
    pool: &TransportPool,
) -> Result<Arc<dyn TokenSource>, UimError> {
    let credentials = config.credentials.clone().ok_or_else(|| {
        UimError::invalid_config("authorization is enabled but no client credentials are set")
    })?;
    let endpoint: Uri = config.token_endpoint.parse().map_err(|e| {
        UimError::invalid_config(format!(
            "invalid token endpoint '{}': {e}",
            config.token_endpoint
        ))
    })?;
    let scheme = match endpoint.scheme_str() {
        Some(scheme) => scheme.parse::<Scheme>()?,
        None => {
            return Err(UimError::invalid_config(format!(
                "token endpoint '{}' has no scheme",
                config.token_endpoint
            )));
        }
    };

    let timeouts = TimeoutPolicy::resolve(&CallOverrides::default(), config);
    let key = TransportKey {
        connect_timeout: timeouts.connect,
        proxy: proxy
            .select(scheme, endpoint.host().unwrap_or_default(), endpoint.port_u16())
            .cloned(),
        insecure: config.insecure,
    };
    let transport = pool.get(&key)?;

    Ok(Arc::new(ClientCredentialsSource::new(
        endpoint,
        credentials,
        transport,
        timeouts,
        config.max_body_size,
    )))
}
