//! Per-call transport policy and the per-posture transport pool.
//!
//! Every call resolves a [`TimeoutPolicy`] and a [`TransportKey`] (connect
//! timeout, proxy, TLS verification). Each distinct key gets one immutable
//! hyper client, built on first use and shared afterwards; no call ever
//! reconfigures a transport another call may be using.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use http::{HeaderValue, Uri, Version};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use regex::RegexSet;

use crate::config::{
    ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, ProxyConfig, Scheme,
    TlsRootConfig, TransportConfig,
};
use crate::error::{ClientErrorCode, TimeoutPhase, UimError};
use crate::request::CallOverrides;
use crate::response::{BodyReadError, RawResponse, read_body_limited};
use crate::tls;

/// Effective read and connect timeouts of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub read: Duration,
    pub connect: Duration,
}

impl TimeoutPolicy {
    /// First positive value of per-call, per-client and transport-level
    /// settings, else the hard default; read and connect independently.
    #[must_use]
    pub fn resolve(call: &CallOverrides, config: &ClientConfig) -> Self {
        Self {
            read: first_positive(
                [
                    call.read_timeout,
                    config.read_timeout,
                    config.transport.read_timeout,
                ],
                DEFAULT_READ_TIMEOUT,
            ),
            connect: first_positive(
                [
                    call.connect_timeout,
                    config.connect_timeout,
                    config.transport.connect_timeout,
                ],
                DEFAULT_CONNECT_TIMEOUT,
            ),
        }
    }
}

fn first_positive(candidates: [Option<Duration>; 3], default: Duration) -> Duration {
    candidates
        .into_iter()
        .flatten()
        .find(|d| !d.is_zero())
        .unwrap_or(default)
}

/// A resolved proxy endpoint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyTarget {
    uri: Uri,
    authorization: Option<HeaderValue>,
}

impl ProxyTarget {
    /// Parse `http://[user:pass@]host:port`; a bare `host:port` is read as
    /// `http://host:port`.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidConfig` if the value does not parse or names a
    /// scheme other than http.
    pub fn parse(raw: &str) -> Result<Self, UimError> {
        let with_scheme = if raw.contains("://") {
            raw.to_owned()
        } else {
            format!("http://{raw}")
        };
        let url = url::Url::parse(&with_scheme)
            .map_err(|e| UimError::invalid_config(format!("invalid proxy url: {e}")))?;
        if url.scheme() != "http" {
            return Err(UimError::invalid_config(format!(
                "unsupported proxy scheme '{}', only http proxies are supported",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| UimError::invalid_config("proxy url has no host"))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let authorization = if url.username().is_empty() {
            None
        } else {
            let username = urlencoding::decode(url.username())
                .map_err(|e| UimError::invalid_config(format!("invalid proxy username: {e}")))?;
            let password = urlencoding::decode(url.password().unwrap_or_default())
                .map_err(|e| UimError::invalid_config(format!("invalid proxy password: {e}")))?;
            let encoded = STANDARD.encode(format!("{username}:{password}"));
            let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
                .map_err(|e| UimError::invalid_config(format!("invalid proxy credentials: {e}")))?;
            value.set_sensitive(true);
            Some(value)
        };

        let uri = format!("http://{host}:{port}")
            .parse::<Uri>()
            .map_err(|e| UimError::invalid_config(format!("invalid proxy url: {e}")))?;

        Ok(Self { uri, authorization })
    }

    #[must_use]
    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

impl fmt::Debug for ProxyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyTarget")
            .field("uri", &self.uri)
            .field("authenticated", &self.authorization.is_some())
            .finish()
    }
}

/// Compiled no-proxy list.
///
/// Entries starting with `*` match any host ending in the rest of the entry
/// (`*.example.com`); other entries are regular expressions searched in the
/// destination host and `host:port`.
#[derive(Debug, Clone, Default)]
pub struct NoProxy {
    patterns: Option<RegexSet>,
}

impl NoProxy {
    /// Compile a comma-separated list.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidConfig` when an entry is not a valid pattern.
    pub fn parse(list: &str) -> Result<Self, UimError> {
        let patterns: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.strip_prefix('*') {
                Some(suffix) => format!("^.*{}$", regex::escape(suffix)),
                None => entry.to_owned(),
            })
            .collect();

        if patterns.is_empty() {
            return Ok(Self::default());
        }

        let set = RegexSet::new(&patterns)
            .map_err(|e| UimError::invalid_config(format!("invalid no-proxy pattern: {e}")))?;
        Ok(Self {
            patterns: Some(set),
        })
    }

    #[must_use]
    pub fn matches(&self, host: &str, port: Option<u16>) -> bool {
        let Some(set) = &self.patterns else {
            return false;
        };
        if set.is_match(host) {
            return true;
        }
        port.is_some_and(|port| set.is_match(&format!("{host}:{port}")))
    }
}

/// Proxy selection, resolved once when the client is built.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    http: Option<ProxyTarget>,
    https: Option<ProxyTarget>,
    no_proxy: NoProxy,
}

impl ProxySettings {
    /// Explicit values first, then `HTTPS_PROXY`/`https_proxy`,
    /// `HTTP_PROXY`/`http_proxy` and `NO_PROXY`/`no_proxy`.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidConfig` for an unparsable proxy URL or no-proxy
    /// pattern.
    pub fn from_config(config: &ProxyConfig) -> Result<Self, UimError> {
        let http = resolve_proxy(config.http_proxy.as_deref(), "HTTP_PROXY", "http_proxy")?;
        let https = resolve_proxy(config.https_proxy.as_deref(), "HTTPS_PROXY", "https_proxy")?;
        let no_proxy = match config.no_proxy.as_deref() {
            Some(list) => NoProxy::parse(list)?,
            None => env_var("NO_PROXY", "no_proxy")
                .map(|list| NoProxy::parse(&list))
                .transpose()?
                .unwrap_or_default(),
        };

        if http.is_some() || https.is_some() {
            tracing::debug!(
                http_proxy = ?http.as_ref().map(ProxyTarget::uri),
                https_proxy = ?https.as_ref().map(ProxyTarget::uri),
                "proxy configured"
            );
        }

        Ok(Self {
            http,
            https,
            no_proxy,
        })
    }

    /// Proxy for a destination, or `None` for a direct connection.
    #[must_use]
    pub fn select(&self, scheme: Scheme, host: &str, port: Option<u16>) -> Option<&ProxyTarget> {
        let proxy = match scheme {
            Scheme::Https => self.https.as_ref(),
            Scheme::Http => self.http.as_ref(),
        }?;
        if self.no_proxy.matches(host, port) {
            return None;
        }
        Some(proxy)
    }
}

fn resolve_proxy(
    explicit: Option<&str>,
    upper: &str,
    lower: &str,
) -> Result<Option<ProxyTarget>, UimError> {
    let raw = match explicit {
        Some(value) => Some(value.to_owned()),
        None => env_var(upper, lower),
    };
    raw.filter(|value| !value.trim().is_empty())
        .map(|value| ProxyTarget::parse(value.trim()))
        .transpose()
}

fn env_var(upper: &str, lower: &str) -> Option<String> {
    std::env::var(upper)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var(lower).ok().filter(|v| !v.is_empty()))
}

/// Transport posture: everything a hyper client is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub connect_timeout: Duration,
    pub proxy: Option<ProxyTarget>,
    pub insecure: bool,
}

type DirectClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;
type TunneledClient = Client<HttpsConnector<Tunnel<HttpConnector>>, Full<Bytes>>;

/// One immutable hyper client.
#[derive(Clone)]
pub enum Transport {
    Direct(DirectClient),
    Tunneled(TunneledClient),
}

impl Transport {
    pub async fn send(
        &self,
        request: http::Request<Full<Bytes>>,
    ) -> Result<http::Response<Incoming>, hyper_util::client::legacy::Error> {
        match self {
            Self::Direct(client) => client.request(request).await,
            Self::Tunneled(client) => client.request(request).await,
        }
    }

    /// Send `request` and buffer the response, all within `read_timeout`.
    pub async fn round_trip(
        &self,
        request: http::Request<Full<Bytes>>,
        read_timeout: Duration,
        max_body_size: usize,
    ) -> Result<(RawResponse, Version), RoundTripError> {
        let exchange = async {
            let response = self.send(request).await.map_err(RoundTripError::Send)?;
            let (parts, body) = response.into_parts();
            let body = read_body_limited(body, max_body_size)
                .await
                .map_err(RoundTripError::Body)?;
            Ok((RawResponse::new(parts.status, parts.headers, body), parts.version))
        };
        tokio::time::timeout(read_timeout, exchange)
            .await
            .map_err(|_| RoundTripError::ReadTimeout)?
    }
}

/// Failure of one request/response exchange.
#[derive(Debug)]
pub enum RoundTripError {
    /// No response head arrived (connect, TLS, write)
    Send(hyper_util::client::legacy::Error),
    /// The exchange did not finish within the read timeout
    ReadTimeout,
    Body(BodyReadError),
}

impl fmt::Display for RoundTripError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(e) => write!(f, "request failed: {e}"),
            Self::ReadTimeout => f.write_str("timed out waiting for the response"),
            Self::Body(BodyReadError::TooLarge { limit, actual }) => {
                write!(f, "response body exceeds {limit} bytes (got at least {actual})")
            }
            Self::Body(BodyReadError::Transport(e)) => {
                write!(f, "failed to read response body: {e}")
            }
        }
    }
}

impl StdError for RoundTripError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Send(e) => Some(e),
            Self::Body(BodyReadError::Transport(e)) => Some(&**e as &(dyn StdError + 'static)),
            Self::ReadTimeout | Self::Body(BodyReadError::TooLarge { .. }) => None,
        }
    }
}

/// Lazily built transports, one per client-level posture.
///
/// Only postures using the client's own connect timeout are kept; the
/// remaining key parts (proxy, TLS verification) take a handful of values,
/// so the map stays small. A call overriding the connect timeout gets a
/// transport of its own that is dropped with the call.
pub struct TransportPool {
    settings: TransportConfig,
    connect_timeout: Duration,
    transports: Mutex<HashMap<TransportKey, Transport>>,
}

impl TransportPool {
    pub fn new(settings: TransportConfig, connect_timeout: Duration) -> Self {
        Self {
            settings,
            connect_timeout,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Transport for `key`: shared when it uses the client's connect
    /// timeout, built for this call otherwise.
    pub fn get(&self, key: &TransportKey) -> Result<Transport, UimError> {
        if key.connect_timeout != self.connect_timeout {
            let connect_timeout_ms =
                u64::try_from(key.connect_timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::debug!(connect_timeout_ms, "building per-call transport");
            return build_transport(key, &self.settings);
        }

        let mut transports = self.transports.lock();
        if let Some(transport) = transports.get(key) {
            return Ok(transport.clone());
        }
        let transport = build_transport(key, &self.settings)?;
        tracing::debug!(
            proxied = key.proxy.is_some(),
            insecure = key.insecure,
            "built transport"
        );
        transports.insert(key.clone(), transport.clone());
        Ok(transport)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }
}

fn build_transport(key: &TransportKey, settings: &TransportConfig) -> Result<Transport, UimError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(key.connect_timeout));

    let mut client_builder = Client::builder(TokioExecutor::new());
    client_builder
        .pool_timer(TokioTimer::new())
        .pool_max_idle_per_host(settings.pool_max_idle_per_host);
    if let Some(idle_timeout) = settings.pool_idle_timeout {
        client_builder.pool_idle_timeout(idle_timeout);
    }

    let transport = match &key.proxy {
        None => {
            let connector = https_connector(http, settings.tls_roots, key.insecure)?;
            Transport::Direct(client_builder.build::<_, Full<Bytes>>(connector))
        }
        Some(proxy) => {
            let mut tunnel = Tunnel::new(proxy.uri.clone(), http);
            if let Some(authorization) = &proxy.authorization {
                tunnel = tunnel.with_auth(authorization.clone());
            }
            let connector = https_connector(tunnel, settings.tls_roots, key.insecure)?;
            Transport::Tunneled(client_builder.build::<_, Full<Bytes>>(connector))
        }
    };
    Ok(transport)
}

fn https_connector<H>(
    inner: H,
    tls_roots: TlsRootConfig,
    insecure: bool,
) -> Result<HttpsConnector<H>, UimError> {
    if insecure {
        tracing::warn!("TLS certificate verification disabled; use only for testing");
        let config = tls::insecure_client_config().map_err(UimError::invalid_config)?;
        return Ok(hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(inner));
    }
    let builder = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(tls::get_crypto_provider())
            .map_err(|e| {
                UimError::client_with_source(
                    ClientErrorCode::InvalidConfig,
                    "failed to initialize TLS",
                    e,
                )
            })?,
        TlsRootConfig::Native => {
            let config = tls::native_roots_client_config().map_err(UimError::invalid_config)?;
            hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(config)
        }
    };
    Ok(builder
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(inner))
}

/// Wrap a failed exchange of attempt number `attempts` (1-based) as a
/// client error.
pub fn failure_error(err: RoundTripError, attempts: u32, policy: TimeoutPolicy) -> UimError {
    if let RoundTripError::Body(BodyReadError::TooLarge { limit, actual }) = err {
        return UimError::client(
            ClientErrorCode::ResponseTooLarge,
            format!(
                "Response body exceeds the {limit} byte limit (received at least {actual} bytes)"
            ),
        );
    }
    if matches!(err, RoundTripError::ReadTimeout) {
        return UimError::timeout(attempts, TimeoutPhase::Read(policy.read), Box::new(err));
    }
    match classify(&err) {
        FailureKind::Certificate => UimError::client_with_source(
            ClientErrorCode::Certificate,
            "The server certificate could not be verified",
            err,
        ),
        FailureKind::ConnectTimeout => {
            UimError::timeout(attempts, TimeoutPhase::Connect(policy.connect), Box::new(err))
        }
        FailureKind::Network => UimError::client_with_source(
            ClientErrorCode::Network,
            format!("Network error after {attempts} attempt(s)"),
            err,
        ),
    }
}

/// Transport failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TLS trust-chain failure
    Certificate,
    ConnectTimeout,
    Network,
}

/// Classify a transport error by walking its source chain.
pub fn classify(err: &(dyn StdError + 'static)) -> FailureKind {
    let mut timed_out = false;
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if is_certificate_error(e) {
            return FailureKind::Certificate;
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                timed_out = true;
            }
            // io::Error::source() skips the wrapped error itself
            if let Some(inner) = io_err.get_ref()
                && classify(inner) == FailureKind::Certificate
            {
                return FailureKind::Certificate;
            }
        }
        current = e.source();
    }
    if timed_out {
        FailureKind::ConnectTimeout
    } else {
        FailureKind::Network
    }
}

fn is_certificate_error(err: &(dyn StdError + 'static)) -> bool {
    matches!(
        err.downcast_ref::<rustls::Error>(),
        Some(rustls::Error::InvalidCertificate(_))
    )
}
