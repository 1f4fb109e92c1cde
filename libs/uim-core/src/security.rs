//! Redaction and preview helpers for logs and error messages.

use std::fmt::Write as _;

use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderName, PROXY_AUTHORIZATION};

/// Maximum body preview size for error messages (8KB).
///
/// Failure bodies that do not match the error envelope are quoted in the
/// error message; this bounds how much of them is copied.
pub const ERROR_BODY_PREVIEW_LIMIT: usize = 8 * 1024;

/// Placeholder written instead of credential header values.
pub const REDACTED: &str = "[REDACTED]";

/// Headers whose values never reach a log line.
#[must_use]
pub fn is_sensitive_header(name: &HeaderName) -> bool {
    name == AUTHORIZATION || name == PROXY_AUTHORIZATION
}

/// Lossy UTF-8 preview of at most `limit` bytes of `body`.
#[must_use]
pub fn body_preview(body: &[u8], limit: usize) -> String {
    let end = body.len().min(limit);
    let mut preview = String::from_utf8_lossy(&body[..end]).trim().to_owned();
    if body.len() > limit {
        preview.push_str("...");
    }
    preview
}

/// Render headers as `name: value` lines with credentials redacted.
#[must_use]
pub fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        let value = if is_sensitive_header(name) {
            REDACTED
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = write!(out, "{name}: {value}");
    }
    out
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_format_headers_redacts_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        headers.insert("x-sdk-client", HeaderValue::from_static("rust"));

        let rendered = format_headers(&headers);
        assert!(rendered.contains("authorization: [REDACTED]"));
        assert!(rendered.contains("x-sdk-client: rust"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_body_preview_truncates() {
        assert_eq!(body_preview(b"  short  ", 64), "short");
        assert_eq!(body_preview(b"abcdef", 3), "abc...");
    }
}
