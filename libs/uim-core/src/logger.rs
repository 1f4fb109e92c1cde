//! Per-attempt request logging.
//!
//! The executor hands one [`AttemptRecord`] per attempt to the client's
//! [`RequestLogger`], whatever the outcome.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::{HeaderMap, Method, Uri, Version};
use parking_lot::Mutex;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::response::RawResponse;
use crate::security::format_headers;

/// `DEBUG` list entry enabling wire-level logs.
pub const DEBUG_TAG: &str = "sdk";

/// Template used when none is given.
pub const DEFAULT_LOGGER_TEMPLATE: &str =
    r#"{time}: "{method} {uri} HTTP/{version}" {code} {cost} {hostname}"#;

/// Everything known about one attempt.
pub struct AttemptRecord<'a> {
    /// 0-based attempt index
    pub attempt: u32,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub request_headers: &'a HeaderMap,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    /// Buffered response, when one arrived
    pub response: Option<&'a RawResponse>,
    /// HTTP version the response arrived with
    pub version: Option<Version>,
    /// Transport or body failure, when no usable response arrived
    pub error: Option<&'a (dyn StdError + 'static)>,
}

impl fmt::Debug for AttemptRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptRecord")
            .field("attempt", &self.attempt)
            .field("method", self.method)
            .field("uri", self.uri)
            .field("elapsed", &self.elapsed)
            .field("status", &self.response.map(RawResponse::status))
            .field("error", &self.error.map(ToString::to_string))
            .finish_non_exhaustive()
    }
}

impl AttemptRecord<'_> {
    #[must_use]
    pub fn status(&self) -> Option<http::StatusCode> {
        self.response.map(RawResponse::status)
    }

    /// Failed transport, or a non-2xx status.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.response.is_some_and(|r| !r.is_success())
    }
}

/// Sink for per-attempt records, injected at client construction.
pub trait RequestLogger: Send + Sync {
    fn log_attempt(&self, record: &AttemptRecord<'_>);
}

/// True when the comma-separated `DEBUG` environment variable lists `tag`.
#[must_use]
pub fn debug_allowed_from_env(tag: &str) -> bool {
    std::env::var("DEBUG")
        .map(|value| value.split(',').any(|part| part.trim() == tag))
        .unwrap_or(false)
}

/// Default logger: one structured `tracing` event per attempt.
///
/// With `debug` on, a second debug event carries the wire headers (the
/// credentials redacted) and the response body.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger {
    debug: bool,
}

impl TracingLogger {
    #[must_use]
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Debug output when `debug` is set or `DEBUG` lists `sdk`.
    #[must_use]
    pub fn from_env(debug: bool) -> Self {
        Self {
            debug: debug || debug_allowed_from_env(DEBUG_TAG),
        }
    }

    #[must_use]
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}

impl RequestLogger for TracingLogger {
    fn log_attempt(&self, record: &AttemptRecord<'_>) {
        let elapsed_ms = u64::try_from(record.elapsed.as_millis()).unwrap_or(u64::MAX);
        let status = record.status().map(|s| s.as_u16());

        if let Some(error) = record.error {
            tracing::warn!(
                attempt = record.attempt,
                method = %record.method,
                uri = %record.uri,
                elapsed_ms,
                error = %error,
                "request attempt failed"
            );
        } else if record.is_failure() {
            tracing::warn!(
                attempt = record.attempt,
                method = %record.method,
                uri = %record.uri,
                elapsed_ms,
                status,
                "request attempt returned an error status"
            );
        } else {
            tracing::debug!(
                attempt = record.attempt,
                method = %record.method,
                uri = %record.uri,
                elapsed_ms,
                status,
                "request attempt completed"
            );
        }

        if self.debug {
            tracing::debug!(
                attempt = record.attempt,
                request_headers = %format_headers(record.request_headers),
                response_headers = %record
                    .response
                    .map(|r| format_headers(r.headers()))
                    .unwrap_or_default(),
                response_body = %record.response.map(RawResponse::text).unwrap_or_default(),
                "request attempt wire"
            );
        }
    }
}

/// Level a [`TemplateLogger`] emits at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Access-log style logger rendering a placeholder template.
///
/// Supported placeholders: `{time}` `{start_time}` `{ts}` `{pid}` `{host}`
/// `{method}` `{uri}` `{version}` `{target}` `{hostname}` `{code}`
/// `{error}` `{req_headers}` `{res_body}` `{res_headers}` `{cost}`.
/// Unknown placeholders are left as they are.
#[derive(Debug)]
pub struct TemplateLogger {
    level: LogLevel,
    template: Mutex<String>,
    open: AtomicBool,
    last_message: Mutex<String>,
    hostname: String,
}

impl Default for TemplateLogger {
    fn default() -> Self {
        Self::new(LogLevel::default(), DEFAULT_LOGGER_TEMPLATE)
    }
}

impl TemplateLogger {
    /// Open logger; an empty template selects [`DEFAULT_LOGGER_TEMPLATE`].
    #[must_use]
    pub fn new(level: LogLevel, template: &str) -> Self {
        let template = if template.is_empty() {
            DEFAULT_LOGGER_TEMPLATE
        } else {
            template
        };
        Self {
            level,
            template: Mutex::new(template.to_owned()),
            open: AtomicBool::new(true),
            last_message: Mutex::new(String::new()),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Stop emitting; lines are still rendered and kept as the last message.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn set_template(&self, template: &str) {
        *self.template.lock() = template.to_owned();
    }

    #[must_use]
    pub fn template(&self) -> String {
        self.template.lock().clone()
    }

    /// Last rendered line.
    #[must_use]
    pub fn last_message(&self) -> String {
        self.last_message.lock().clone()
    }

    fn render(&self, record: &AttemptRecord<'_>, now: OffsetDateTime) -> String {
        let template = self.template.lock().clone();
        let version = match record.version {
            Some(Version::HTTP_10) => "1.0",
            Some(Version::HTTP_2) => "2",
            Some(Version::HTTP_3) => "3",
            _ => "1.1",
        };
        let uri = record
            .uri
            .path_and_query()
            .map_or_else(|| record.uri.path().to_owned(), ToString::to_string);

        let fields: [(&str, String); 16] = [
            ("{time}", clock_time(now)),
            ("{start_time}", clock_time(record.started_at)),
            ("{ts}", now.format(&Rfc3339).unwrap_or_default()),
            ("{pid}", std::process::id().to_string()),
            ("{host}", record.uri.host().unwrap_or_default().to_owned()),
            ("{method}", record.method.to_string()),
            ("{uri}", uri),
            ("{version}", version.to_owned()),
            ("{target}", record.uri.to_string()),
            ("{hostname}", self.hostname.clone()),
            (
                "{code}",
                record
                    .status()
                    .map(|s| s.as_u16().to_string())
                    .unwrap_or_default(),
            ),
            (
                "{error}",
                record.error.map(ToString::to_string).unwrap_or_default(),
            ),
            ("{req_headers}", format_headers(record.request_headers)),
            (
                "{res_body}",
                record.response.map(RawResponse::text).unwrap_or_default(),
            ),
            (
                "{res_headers}",
                record
                    .response
                    .map(|r| format_headers(r.headers()))
                    .unwrap_or_default(),
            ),
            ("{cost}", format!("{}ms", record.elapsed.as_millis())),
        ];

        substitute(&template, &fields)
    }
}

impl RequestLogger for TemplateLogger {
    fn log_attempt(&self, record: &AttemptRecord<'_>) {
        let line = self.render(record, OffsetDateTime::now_utc());
        if self.is_open() {
            match self.level {
                LogLevel::Debug => tracing::debug!("{line}"),
                LogLevel::Info => tracing::info!("{line}"),
                LogLevel::Warn => tracing::warn!("{line}"),
                LogLevel::Error => tracing::error!("{line}"),
            }
        }
        *self.last_message.lock() = line;
    }
}

/// Replace each known `{name}` token of `template` in one left-to-right
/// pass; substituted values are never scanned again.
fn substitute(template: &str, fields: &[(&str, String)]) -> String {
    let mut line = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        line.push_str(&rest[..open]);
        let tail = &rest[open..];
        let field = tail
            .find('}')
            .map(|close| &tail[..=close])
            .and_then(|token| fields.iter().find(|(key, _)| *key == token));
        match field {
            Some((key, value)) => {
                line.push_str(value);
                rest = &tail[key.len()..];
            }
            None => {
                line.push('{');
                rest = &tail[1..];
            }
        }
    }
    line.push_str(rest);
    line
}

/// `YYYY-MM-DD HH:MM:SS`
fn clock_time(t: OffsetDateTime) -> String {
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        t.year(),
        u8::from(t.month()),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
}
