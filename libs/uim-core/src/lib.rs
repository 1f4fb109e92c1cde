#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Core of the UIM vendor SDK
//!
//! This crate provides what every generated UIM API binding shares:
//! - Flattening of typed request models into header, query, path and form
//!   parameters
//! - Request assembly with default headers, bearer tokens and a composed
//!   user agent
//! - A hyper/rustls transport with proxy selection, per-call timeouts and
//!   connection pools shared per security posture
//! - A resilient executor that retries transport failures and statuses >= 500
//! - Response decoding into typed payloads or structured server errors
//! - A double-checked OAuth client-credentials token cache
//! - HMAC-SHA256 verification of inbound webhooks and CloudEvents routing
//! - A bounded background queue for deferred calls
//!
//! # Example
//!
//! ```ignore
//! use uim_core::{ApiRequest, Client, Field, Flatten, Param, Placement, RequestDescriptor};
//!
//! #[derive(serde::Serialize)]
//! struct ListAccounts {
//!     #[serde(skip)]
//!     page: u32,
//! }
//!
//! impl Flatten for ListAccounts {
//!     fn fields(&self) -> Vec<Field<'_>> {
//!         vec![Field::new("page", Placement::Query, Param::display(self.page))]
//!     }
//! }
//!
//! impl ApiRequest for ListAccounts {
//!     fn descriptor(&self) -> RequestDescriptor {
//!         RequestDescriptor::new("/v1/accounts").with_method(http::Method::GET)
//!     }
//! }
//!
//! let client = Client::builder()
//!     .credentials("client-id", "client-secret", "https://api.uimkit.chat")
//!     .build()?;
//!
//! let accounts: Vec<Account> = client
//!     .execute(&ListAccounts { page: 1 })
//!     .await?
//!     .into_data()
//!     .unwrap_or_default();
//! ```

mod builder;
mod client;
mod config;
mod error;
pub mod event;
mod flatten;
mod logger;
mod queue;
mod request;
mod response;
mod retry;
pub mod security;
mod tls;
mod token;
mod transport;
mod webhook;

pub use builder::ClientBuilder;
pub use client::Client;
pub use config::{
    AsyncConfig, ClientConfig, Credentials, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DOMAIN,
    DEFAULT_EVENT_SOURCE, DEFAULT_MAX_BODY_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_TOKEN_ENDPOINT,
    DEFAULT_USER_AGENT, ExponentialBackoff, ProxyConfig, RetryConfig, Scheme, TlsRootConfig,
    TransportConfig, VERSION,
};
pub use error::{
    BoxError, ClientError, ClientErrorCode, DEFAULT_CLIENT_ERROR_STATUS,
    DEFAULT_SERVER_ERROR_CODE, ServerError, TimeoutPhase, UimError,
};
pub use event::{CloudEvent, EventHandler, EventRouter};
pub use flatten::{Field, Flatten, JsonBlob, Param, Params, Placement, Shape, flatten};
pub use logger::{
    AttemptRecord, DEBUG_TAG, DEFAULT_LOGGER_TEMPLATE, LogLevel, RequestLogger, TemplateLogger,
    TracingLogger, debug_allowed_from_env,
};
pub use queue::{DispatchQueue, Task};
pub use request::{
    ApiRequest, CallOverrides, FORM, JSON, PreparedRequest, RequestDescriptor, assemble,
};
pub use response::{ApiResponse, RawResponse, decode};
pub use retry::{AttemptResult, Outcome, calculate_backoff, decide};
pub use token::{EXPIRY_MARGIN, FetchedToken, TokenCache, TokenSource};
pub use transport::{NoProxy, ProxySettings, ProxyTarget, TimeoutPolicy};
pub use webhook::{
    KEY_HEADER, SIGNATURE_HEADER, Webhook, WebhookEvent, WebhookVerifier, check_signature, sign,
};
