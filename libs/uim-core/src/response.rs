use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;

use crate::error::{BoxError, ClientError, ClientErrorCode, ServerError, UimError};
use crate::request::JSON;

/// Fully buffered HTTP response of one attempt.
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl RawResponse {
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Status in `[200, 300)`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Body as text; invalid UTF-8 is replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Successful response together with its decoded payload.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    raw: RawResponse,
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    #[must_use]
    pub fn raw(&self) -> &RawResponse {
        &self.raw
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.raw.status
    }

    /// Decoded payload; `None` for an empty body or a non-JSON accept
    /// format.
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    #[must_use]
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    #[must_use]
    pub fn into_parts(self) -> (RawResponse, Option<T>) {
        (self.raw, self.data)
    }
}

/// Failure while buffering a response body.
#[derive(Debug)]
pub enum BodyReadError {
    TooLarge { limit: usize, actual: usize },
    Transport(BoxError),
}

/// Buffer a body, failing once more than `limit` bytes arrive.
pub async fn read_body_limited<B>(body: B, limit: usize) -> Result<Bytes, BodyReadError>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BodyReadError::Transport(e.into()))?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(BodyReadError::TooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Classify a buffered response and decode its payload.
///
/// Non-2xx becomes a [`ServerError`] without touching `T`. A 2xx body is
/// decoded only when it is non-empty and `accept_format` is JSON.
///
/// # Errors
///
/// - [`UimError::Server`] for non-2xx responses
/// - `SDK.JsonUnmarshalError` when a success body does not decode into `T`;
///   the response stays reachable through [`ClientError::response`]
pub fn decode<T: DeserializeOwned>(
    raw: RawResponse,
    accept_format: &str,
) -> Result<ApiResponse<T>, UimError> {
    if !raw.is_success() {
        return Err(ServerError::from_response(&raw).into());
    }

    if raw.body.is_empty() || !is_json(accept_format) {
        return Ok(ApiResponse { raw, data: None });
    }

    match serde_json::from_slice(&raw.body) {
        Ok(data) => Ok(ApiResponse {
            raw,
            data: Some(data),
        }),
        Err(e) => Err(ClientError::new(
            ClientErrorCode::JsonUnmarshal,
            format!("Failed to unmarshal response body: {e}"),
        )
        .with_source(e)
        .with_response(raw)
        .into()),
    }
}

fn is_json(format: &str) -> bool {
    format
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON))
}
