use std::fmt;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::response::RawResponse;
use crate::security::{ERROR_BODY_PREVIEW_LIMIT, body_preview};

/// Boxed error used as the wrapped cause of client errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP status reported by every [`ClientError`].
pub const DEFAULT_CLIENT_ERROR_STATUS: u16 = 400;

/// Code reported by server errors whose body carried no code.
pub const DEFAULT_SERVER_ERROR_CODE: &str = "SDK.ServerError";

/// Classification of local failures.
///
/// The string form (`SDK.*`) is stable and is what [`UimError::code`]
/// returns for client errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClientErrorCode {
    /// Generic local failure
    ClientError,
    /// A field carried a placement the flattener does not know
    UnsupportedParamPosition,
    /// The async dispatch queue is not running
    AsyncFunctionNotEnabled,
    /// Request serialization failed
    JsonMarshal,
    /// Response deserialization failed
    JsonUnmarshal,
    /// Read or connect timeout after all attempts
    Timeout,
    /// Transport failure after all attempts
    Network,
    /// TLS trust-chain failure (never retried)
    Certificate,
    /// The token endpoint rejected the client credentials
    AuthenticationFailed,
    /// Client configuration is unusable
    InvalidConfig,
    /// The request could not be turned into a valid HTTP request
    InvalidRequest,
    /// Response body exceeded the configured limit
    ResponseTooLarge,
    /// Inbound webhook failed key or signature verification
    InvalidWebhook,
    /// No handler is registered for an inbound event type
    UnsupportedEventType,
}

impl ClientErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientError => "SDK.ClientError",
            Self::UnsupportedParamPosition => "SDK.UnsupportedParamPosition",
            Self::AsyncFunctionNotEnabled => "SDK.AsyncFunctionNotEnabled",
            Self::JsonMarshal => "SDK.JsonMarshalError",
            Self::JsonUnmarshal => "SDK.JsonUnmarshalError",
            Self::Timeout => "SDK.TimeoutError",
            Self::Network => "SDK.NetworkError",
            Self::Certificate => "SDK.CertificateError",
            Self::AuthenticationFailed => "SDK.AuthenticationFailed",
            Self::InvalidConfig => "SDK.InvalidConfig",
            Self::InvalidRequest => "SDK.InvalidRequest",
            Self::ResponseTooLarge => "SDK.ResponseTooLarge",
            Self::InvalidWebhook => "SDK.InvalidWebhook",
            Self::UnsupportedEventType => "SDK.UnsupportedEventType",
        }
    }
}

impl fmt::Display for ClientErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local failure: bad configuration, (de)serialization, transport, auth.
#[derive(Debug)]
pub struct ClientError {
    code: ClientErrorCode,
    message: String,
    source: Option<BoxError>,
    response: Option<Box<RawResponse>>,
}

impl ClientError {
    #[must_use]
    pub fn new(code: ClientErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            response: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub(crate) fn with_response(mut self, response: RawResponse) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    #[must_use]
    pub fn code(&self) -> ClientErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The buffered response, for errors raised after a response arrived
    /// (e.g. a success body that failed to decode).
    #[must_use]
    pub fn response(&self) -> Option<&RawResponse> {
        self.response.as_deref()
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(source) = &self.source {
            write!(f, "\ncaused by:\n{source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// `{code, message}` error envelope returned by the platform.
#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    host_id: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    recommend: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Remote rejection: any non-2xx response.
#[derive(Debug, Clone)]
pub struct ServerError {
    status: StatusCode,
    code: String,
    message: String,
    request_id: Option<String>,
    host_id: Option<String>,
    recommend: Option<String>,
    headers: HeaderMap,
}

impl ServerError {
    /// Build from a buffered failure response.
    ///
    /// The body is parsed as a `{code, message}` envelope; when it does not
    /// match, the message falls back to the status line plus a bounded
    /// preview of the body.
    #[must_use]
    pub fn from_response(response: &RawResponse) -> Self {
        let status = response.status();
        let envelope = serde_json::from_slice::<ErrorEnvelope>(response.body())
            .ok()
            .filter(|e| e.code.is_some() || e.message.is_some());

        match envelope {
            Some(envelope) => Self {
                status,
                code: envelope
                    .code
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| DEFAULT_SERVER_ERROR_CODE.to_owned()),
                message: envelope.message.unwrap_or_default(),
                request_id: envelope.request_id,
                host_id: envelope.host_id,
                recommend: envelope.recommend,
                headers: response.headers().clone(),
            },
            None => {
                let preview = body_preview(response.body(), ERROR_BODY_PREVIEW_LIMIT);
                let message = if preview.is_empty() {
                    format!("HTTP {status}")
                } else {
                    format!("HTTP {status}: {preview}")
                };
                Self {
                    status,
                    code: DEFAULT_SERVER_ERROR_CODE.to_owned(),
                    message,
                    request_id: None,
                    host_id: None,
                    recommend: None,
                    headers: response.headers().clone(),
                }
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    #[must_use]
    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    #[must_use]
    pub fn recommend(&self) -> Option<&str> {
        self.recommend.as_deref()
    }

    /// Response headers of the failed call.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DEFAULT_SERVER_ERROR_CODE} (HTTP {}) [{}] {}",
            self.status.as_u16(),
            self.code,
            self.message
        )?;
        if let Some(request_id) = &self.request_id {
            write!(f, " (request id: {request_id})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Error returned by every fallible SDK operation.
///
/// Both variants expose the same contract through [`UimError::status`],
/// [`UimError::code`], [`UimError::message`] and the standard `source()`
/// chain, so callers can branch without knowing transport internals.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UimError {
    /// Local failure
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Remote rejection
    #[error(transparent)]
    Server(#[from] ServerError),
}

impl UimError {
    pub(crate) fn client(code: ClientErrorCode, message: impl Into<String>) -> Self {
        Self::Client(ClientError::new(code, message))
    }

    pub(crate) fn client_with_source(
        code: ClientErrorCode,
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Client(ClientError::new(code, message).with_source(source))
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::client(ClientErrorCode::InvalidConfig, message)
    }

    pub(crate) fn json_marshal(source: serde_json::Error) -> Self {
        Self::client_with_source(
            ClientErrorCode::JsonMarshal,
            "Failed to marshal request",
            source,
        )
    }

    pub(crate) fn async_not_enabled() -> Self {
        Self::client(
            ClientErrorCode::AsyncFunctionNotEnabled,
            "Async function is not enabled in client, please invoke 'Client::enable_async'",
        )
    }

    pub(crate) fn unsupported_param_position(position: &str) -> Self {
        Self::client(
            ClientErrorCode::UnsupportedParamPosition,
            format!(
                "Specified param position ({position}) is not supported, please upgrade sdk and retry"
            ),
        )
    }

    pub(crate) fn timeout(attempts: u32, phase: TimeoutPhase, source: BoxError) -> Self {
        let retries = attempts.saturating_sub(1);
        Self::client_with_source(
            ClientErrorCode::Timeout,
            format!(
                "The request timed out {attempts} times ({retries} for retry) waiting for {phase} \
                 after {}ms, perhaps the threshold should be raised a little?",
                phase.duration().as_millis()
            ),
            source,
        )
    }

    /// HTTP status of the failure: the response status for server errors,
    /// [`DEFAULT_CLIENT_ERROR_STATUS`] for client errors.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            Self::Client(_) => DEFAULT_CLIENT_ERROR_STATUS,
            Self::Server(e) => e.status().as_u16(),
        }
    }

    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Client(e) => e.code().as_str(),
            Self::Server(e) => e.code(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Client(e) => e.message(),
            Self::Server(e) => e.message(),
        }
    }

    /// Local failure classification, `None` for server errors.
    #[must_use]
    pub fn client_code(&self) -> Option<ClientErrorCode> {
        match self {
            Self::Client(e) => Some(e.code()),
            Self::Server(_) => None,
        }
    }

    #[must_use]
    pub fn as_server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server(e) => Some(e),
            Self::Client(_) => None,
        }
    }
}

/// Which timeout expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect(Duration),
    Read(Duration),
}

impl TimeoutPhase {
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Connect(d) | Self::Read(d) => d,
        }
    }
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(_) => f.write_str("connect"),
            Self::Read(_) => f.write_str("read"),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::error::Error;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    fn raw(status: u16, body: &'static str) -> RawResponse {
        RawResponse::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn test_client_error_preserves_source() {
        let err = UimError::client_with_source(
            ClientErrorCode::Network,
            "network error",
            TestError("connection refused"),
        );

        let source = err.source().expect("client error should expose its cause");
        let downcast = source.downcast_ref::<TestError>();
        assert_eq!(downcast.unwrap().0, "connection refused");
        assert!(err.to_string().contains("caused by:\nconnection refused"));
    }

    #[test]
    fn test_client_error_uniform_contract() {
        let err = UimError::async_not_enabled();
        assert_eq!(err.status(), 400);
        assert_eq!(err.code(), "SDK.AsyncFunctionNotEnabled");
        assert!(err.message().contains("enable_async"));
        assert_eq!(
            err.client_code(),
            Some(ClientErrorCode::AsyncFunctionNotEnabled)
        );
    }

    #[test]
    fn test_server_error_parses_envelope() {
        let response = raw(
            403,
            r#"{"code":"Forbidden.App","message":"app disabled","request_id":"r-1","host_id":"h-1","recommend":"contact support"}"#,
        );
        let err = UimError::from(ServerError::from_response(&response));

        assert_eq!(err.status(), 403);
        assert_eq!(err.code(), "Forbidden.App");
        assert_eq!(err.message(), "app disabled");
        let server = err.as_server_error().unwrap();
        assert_eq!(server.request_id(), Some("r-1"));
        assert_eq!(server.host_id(), Some("h-1"));
        assert_eq!(server.recommend(), Some("contact support"));
        assert!(err.source().is_none());
    }

    #[test]
    fn test_server_error_falls_back_for_foreign_body() {
        let response = raw(502, "<html>bad gateway</html>");
        let err = ServerError::from_response(&response);

        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code(), DEFAULT_SERVER_ERROR_CODE);
        assert!(err.message().starts_with("HTTP 502 Bad Gateway"));
        assert!(err.message().contains("bad gateway"));
    }

    #[test]
    fn test_server_error_empty_body() {
        let err = ServerError::from_response(&raw(500, ""));
        assert_eq!(err.message(), "HTTP 500 Internal Server Error");
    }

    #[test]
    fn test_timeout_message_names_phase() {
        let err = UimError::timeout(
            4,
            TimeoutPhase::Connect(Duration::from_secs(10)),
            Box::new(TestError("connect timed out")),
        );
        assert_eq!(err.code(), "SDK.TimeoutError");
        assert!(err.message().contains("timed out 4 times (3 for retry)"));
        assert!(err.message().contains("connect"));
    }
}
