//! Inbound webhook verification.
//!
//! A webhook carries the sender's app id in `X-UIM-Key` and a hex
//! HMAC-SHA256 of the raw body in `X-UIM-Signature`.

use std::fmt;

use hmac::{Hmac, Mac};
use http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ClientErrorCode, UimError};
use crate::event::CloudEvent;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_HEADER: &str = "x-uim-key";
pub const SIGNATURE_HEADER: &str = "x-uim-signature";

/// Hex HMAC-SHA256 of `body` under `secret`.
#[must_use]
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature; malformed hex is a mismatch.
#[must_use]
pub fn check_signature(signature: &str, secret: &[u8], body: &[u8]) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verifies inbound webhooks for one app.
#[derive(Clone)]
pub struct WebhookVerifier {
    app_id: String,
    secret: SecretString,
}

impl fmt::Debug for WebhookVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookVerifier")
            .field("app_id", &self.app_id)
            .finish_non_exhaustive()
    }
}

impl WebhookVerifier {
    #[must_use]
    pub fn new(app_id: impl Into<String>, secret: SecretString) -> Self {
        Self {
            app_id: app_id.into(),
            secret,
        }
    }

    #[must_use]
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Accept when one `X-UIM-Key` value is this app's id and the signature
    /// matches the body.
    ///
    /// # Errors
    ///
    /// Returns `SDK.InvalidWebhook` for any key or signature problem,
    /// without saying which.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), UimError> {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        let accepted = headers
            .get_all(KEY_HEADER)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|key| key == self.app_id)
            && check_signature(signature, self.secret.expose_secret().as_bytes(), body);

        if accepted {
            Ok(())
        } else {
            tracing::debug!(app_id = %self.app_id, "rejected inbound webhook");
            Err(UimError::client(
                ClientErrorCode::InvalidWebhook,
                "invalid webhook",
            ))
        }
    }

    /// [`verify`](Self::verify), then parse the body as a CloudEvent.
    ///
    /// # Errors
    ///
    /// `SDK.InvalidWebhook` from verification, `SDK.JsonUnmarshalError`
    /// when the verified body is not an event.
    pub fn verify_event(&self, headers: &HeaderMap, body: &[u8]) -> Result<CloudEvent, UimError> {
        self.verify(headers, body)?;
        CloudEvent::from_slice(body)
    }
}

/// Batch webhook envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Webhook {
    /// Send time, milliseconds since the epoch
    #[serde(default)]
    pub time_ms: i64,
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub event_type: String,
    /// Event payload, itself JSON text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data: String,
}

impl Webhook {
    /// # Errors
    ///
    /// Returns `SDK.JsonUnmarshalError` when `body` is not a batch envelope.
    pub fn from_slice(body: &[u8]) -> Result<Self, UimError> {
        serde_json::from_slice(body).map_err(|e| {
            UimError::client_with_source(
                ClientErrorCode::JsonUnmarshal,
                format!("Failed to unmarshal webhook: {e}"),
                e,
            )
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;

    const EVENT: &[u8] =
        br#"{"specversion":"1.0","id":"e1","source":"uim.source","type":"uim.send_message","data":{"text":"hi"}}"#;

    fn flip_first_hex(signature: &str) -> String {
        let mut chars: Vec<char> = signature.chars().collect();
        chars[0] = if chars[0] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    fn headers(keys: &[&'static str], signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for key in keys {
            headers.append(KEY_HEADER, HeaderValue::from_static(key));
        }
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(signature).unwrap());
        headers
    }

    #[test]
    fn test_check_signature() {
        let signature = sign(b"s", b"hello");
        assert_eq!(
            signature,
            "8a06a64224d83d1bf0a2140fab7d5b462cf3f450592c7963910ed331e9031056"
        );
        assert!(check_signature(&signature, b"s", b"hello"));
        assert!(!check_signature(&flip_first_hex(&signature), b"s", b"hello"));
        assert!(!check_signature(&signature, b"other", b"hello"));
        assert!(!check_signature("zz", b"s", b"hello"));
        assert!(!check_signature("", b"s", b"hello"));
    }

    #[test]
    fn test_verify_event() {
        let verifier = WebhookVerifier::new("app-1", SecretString::from("s"));
        let signature = sign(b"s", EVENT);

        let event = verifier
            .verify_event(&headers(&["other", "app-1"], &signature), EVENT)
            .unwrap();
        assert_eq!(event.event_type, "uim.send_message");
    }

    #[test]
    fn test_verify_rejects_uniformly() {
        let verifier = WebhookVerifier::new("app-1", SecretString::from("s"));
        let signature = sign(b"s", EVENT);

        let wrong_key = verifier.verify(&headers(&["app-2"], &signature), EVENT).unwrap_err();
        let bad_signature = verifier
            .verify(&headers(&["app-1"], &flip_first_hex(&signature)), EVENT)
            .unwrap_err();
        let no_key = verifier.verify(&headers(&[], &signature), EVENT).unwrap_err();

        for err in [wrong_key, bad_signature, no_key] {
            assert_eq!(err.code(), "SDK.InvalidWebhook");
            assert_eq!(err.message(), "invalid webhook");
        }
    }

    #[test]
    fn test_parse_webhook_batch() {
        let body = br#"{"time_ms":1714557600000,"events":[{"type":"provider.new_message","data":"{\"text\":\"hi\"}"}]}"#;
        let webhook = Webhook::from_slice(body).unwrap();
        assert_eq!(webhook.time_ms, 1_714_557_600_000);
        assert_eq!(webhook.events.len(), 1);
        assert_eq!(webhook.events[0].event_type, "provider.new_message");
        assert_eq!(webhook.events[0].data, r#"{"text":"hi"}"#);
    }

    #[test]
    fn test_debug_hides_secret() {
        let verifier = WebhookVerifier::new("app-1", SecretString::from("top-secret"));
        assert!(!format!("{verifier:?}").contains("top-secret"));
    }
}
