use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method, Uri};
use serde::Serialize;

use crate::config::{ClientConfig, DEFAULT_USER_AGENT, Scheme, VERSION};
use crate::error::{ClientErrorCode, UimError};
use crate::flatten::{Flatten, Params, flatten};

/// `application/json`
pub const JSON: &str = "application/json";
/// `application/x-www-form-urlencoded`
pub const FORM: &str = "application/x-www-form-urlencoded";

/// User-agent tag keys owned by the library.
const RESERVED_USER_AGENT_KEYS: [&str; 2] = ["core", "rust"];

/// A typed API call: its field table plus its endpoint description.
///
/// `Serialize` is used for the JSON body when the descriptor's content type
/// is JSON and no explicit content was set.
pub trait ApiRequest: Flatten + Serialize + Send + Sync {
    /// Fresh descriptor for one attempt.
    fn descriptor(&self) -> RequestDescriptor;
}

/// Endpoint, parameters and per-call overrides of one logical request.
///
/// Unset scheme, domain, port and base path are filled from the client at
/// assembly time.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    method: Method,
    scheme: Option<Scheme>,
    domain: String,
    port: Option<u16>,
    base_path: String,
    path: String,
    params: Params,
    content: Option<Bytes>,
    accept_format: String,
    read_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    insecure: Option<bool>,
    user_agent: Vec<(String, String)>,
}

impl RequestDescriptor {
    /// `POST path` with the default request headers and a JSON accept
    /// format.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let mut params = Params::default();
        params
            .headers
            .insert("x-sdk-client".to_owned(), format!("rust/{VERSION}"));
        params
            .headers
            .insert("x-sdk-invoke-type".to_owned(), "normal".to_owned());
        params
            .headers
            .insert("accept-encoding".to_owned(), "identity".to_owned());
        params
            .headers
            .insert("content-type".to_owned(), JSON.to_owned());

        Self {
            method: Method::POST,
            scheme: None,
            domain: String::new(),
            port: None,
            base_path: String::new(),
            path: path.into(),
            params,
            content: None,
            accept_format: JSON.to_owned(),
            read_timeout: None,
            connect_timeout: None,
            insecure: None,
            user_agent: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = Some(scheme);
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Override the client's TLS verification posture for this call.
    #[must_use]
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = Some(insecure);
        self
    }

    #[must_use]
    pub fn with_accept_format(mut self, format: impl Into<String>) -> Self {
        self.accept_format = format.into();
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.params
            .headers
            .insert(CONTENT_TYPE.as_str().to_owned(), content_type.into());
        self
    }

    /// Raw body; suppresses JSON serialization of the request object.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Bytes>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Add a parameter by placement tag (`header`, `query`, `path`, `body`).
    ///
    /// # Errors
    ///
    /// Returns `SDK.UnsupportedParamPosition` for an unknown tag with a
    /// non-empty value.
    pub fn add_param(
        &mut self,
        tag: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), UimError> {
        self.params.insert_tagged(tag, key, value)
    }

    /// Add or replace a ` key/value` user-agent tag. The `core` and `rust`
    /// keys are reserved and ignored.
    pub fn append_user_agent(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let lower = key.to_ascii_lowercase();
        if RESERVED_USER_AGENT_KEYS.contains(&lower.as_str()) {
            return;
        }
        let value = value.into();
        match self.user_agent.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.user_agent.push((key, value)),
        }
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn params(&self) -> &Params {
        &self.params
    }

    #[must_use]
    pub fn content(&self) -> Option<&Bytes> {
        self.content.as_ref()
    }

    #[must_use]
    pub fn accept_format(&self) -> &str {
        &self.accept_format
    }

    #[must_use]
    pub fn user_agent_tags(&self) -> &[(String, String)] {
        &self.user_agent
    }

    fn content_type(&self) -> Option<&str> {
        self.params
            .headers
            .get(CONTENT_TYPE.as_str())
            .map(String::as_str)
    }
}

/// Per-call transport overrides carried from the descriptor to the policy
/// resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOverrides {
    pub read_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub insecure: Option<bool>,
}

/// Wire-ready request of one attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub uri: Uri,
    pub scheme: Scheme,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub accept_format: String,
    pub overrides: CallOverrides,
}

/// Assemble the wire request of one attempt.
///
/// `token` is attached as `authorization: Bearer <token>` when present.
///
/// # Errors
///
/// - `SDK.UnsupportedParamPosition` / `SDK.JsonMarshalError` from flattening
///   or body serialization
/// - `SDK.InvalidRequest` when the URL, a header or the form body cannot be
///   encoded
pub fn assemble<R: ApiRequest>(
    request: &R,
    config: &ClientConfig,
    token: Option<&str>,
) -> Result<PreparedRequest, UimError> {
    let mut descriptor = request.descriptor();

    descriptor
        .params
        .headers
        .insert("x-sdk-core-version".to_owned(), VERSION.to_owned());
    if let Some(token) = token {
        descriptor
            .params
            .headers
            .insert("authorization".to_owned(), format!("Bearer {token}"));
    }
    if !descriptor.accept_format.is_empty() {
        descriptor
            .params
            .headers
            .insert("accept".to_owned(), descriptor.accept_format.clone());
    }

    let scheme = descriptor.scheme.unwrap_or(config.scheme);
    let domain = first_non_empty(&descriptor.domain, &config.domain).to_owned();
    let port = descriptor.port.or(config.port);
    let base_path = first_non_empty(&descriptor.base_path, &config.base_path);
    let path = format!("{base_path}{}", descriptor.path);

    descriptor.params.merge(flatten(request)?);

    if descriptor.content.is_none() && descriptor.content_type() == Some(JSON) {
        let body = serde_json::to_vec(request).map_err(UimError::json_marshal)?;
        descriptor.content = Some(Bytes::from(body));
    }

    if domain.is_empty() {
        return Err(invalid_request("request has no domain", None));
    }
    let url = build_url(scheme, &domain, port, &path, &descriptor.params)?;
    let uri = url
        .parse::<Uri>()
        .map_err(|e| invalid_request(format!("invalid request url '{url}'"), Some(e.into())))?;

    let body = if descriptor.params.form.is_empty() {
        descriptor.content.take().unwrap_or_default()
    } else {
        let form = serde_urlencoded::to_string(&descriptor.params.form)
            .map_err(|e| invalid_request("failed to encode form body", Some(e.into())))?;
        descriptor
            .params
            .headers
            .insert(CONTENT_TYPE.as_str().to_owned(), FORM.to_owned());
        Bytes::from(form)
    };

    let mut headers = HeaderMap::with_capacity(descriptor.params.headers.len() + 1);
    for (key, value) in &descriptor.params.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| invalid_request(format!("invalid header name '{key}'"), Some(e.into())))?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            invalid_request(format!("invalid value for header '{key}'"), Some(e.into()))
        })?;
        headers.insert(name, value);
    }
    let user_agent = user_agent(&descriptor.user_agent, config.user_agent.as_deref());
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&user_agent)
            .map_err(|e| invalid_request("invalid user agent", Some(e.into())))?,
    );

    Ok(PreparedRequest {
        method: descriptor.method,
        uri,
        scheme,
        headers,
        body,
        accept_format: descriptor.accept_format,
        overrides: CallOverrides {
            read_timeout: descriptor.read_timeout,
            connect_timeout: descriptor.connect_timeout,
            insecure: descriptor.insecure,
        },
    })
}

fn first_non_empty<'a>(call: &'a str, client: &'a str) -> &'a str {
    if call.is_empty() { client } else { call }
}

fn invalid_request(
    message: impl Into<String>,
    source: Option<crate::error::BoxError>,
) -> UimError {
    match source {
        Some(source) => {
            UimError::client_with_source(ClientErrorCode::InvalidRequest, message, source)
        }
        None => UimError::client(ClientErrorCode::InvalidRequest, message),
    }
}

/// `scheme://domain[:port]path[?query]` with `:name` path parameters
/// substituted (longest names first, values percent-encoded).
fn build_url(
    scheme: Scheme,
    domain: &str,
    port: Option<u16>,
    path: &str,
    params: &Params,
) -> Result<String, UimError> {
    let mut path = path.to_owned();
    let mut names: Vec<_> = params.path.iter().collect();
    names.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    for (name, value) in names {
        path = path.replacen(&format!(":{name}"), &urlencoding::encode(value), 1);
    }

    let mut url = format!("{scheme}://{domain}");
    if let Some(port) = port.filter(|p| *p > 0) {
        url.push(':');
        url.push_str(&port.to_string());
    }
    url.push_str(&path);

    if !params.query.is_empty() {
        let query = serde_urlencoded::to_string(&params.query)
            .map_err(|e| invalid_request("failed to encode query string", Some(e.into())))?;
        url.push('?');
        url.push_str(&query);
    }
    Ok(url)
}

fn user_agent(tags: &[(String, String)], extra: Option<&str>) -> String {
    let mut value = DEFAULT_USER_AGENT.clone();
    for (key, tag) in tags {
        value.push(' ');
        value.push_str(key);
        value.push('/');
        value.push_str(tag);
    }
    if let Some(extra) = extra.filter(|e| !e.is_empty()) {
        value.push_str(" Extra/");
        value.push_str(extra);
    }
    value
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::flatten::{Field, Param, Placement};

    #[derive(Serialize)]
    struct SendMessage {
        account_id: String,
        conversation_id: String,
        text: String,
        trace: String,
        #[serde(skip)]
        form_mode: bool,
    }

    impl Flatten for SendMessage {
        fn fields(&self) -> Vec<Field<'_>> {
            let text_placement = if self.form_mode {
                Placement::Body
            } else {
                Placement::Query
            };
            vec![
                Field::new("account_id", Placement::Path, Param::text(&self.account_id)),
                Field::new(
                    "conversation_id",
                    Placement::Path,
                    Param::text(&self.conversation_id),
                ),
                Field::new("text", text_placement, Param::text(&self.text)),
                Field::new("x-trace", Placement::Header, Param::text(&self.trace)),
            ]
        }
    }

    impl ApiRequest for SendMessage {
        fn descriptor(&self) -> RequestDescriptor {
            let mut descriptor =
                RequestDescriptor::new("/accounts/:account_id/conversations/:conversation_id");
            descriptor.append_user_agent("Example", "1.0");
            descriptor
        }
    }

    fn message() -> SendMessage {
        SendMessage {
            account_id: "acc 1".to_owned(),
            conversation_id: "c1".to_owned(),
            text: "hi there".to_owned(),
            trace: "t-1".to_owned(),
            form_mode: false,
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            base_path: "/v1".to_owned(),
            user_agent: Some("my-app".to_owned()),
            ..Default::default()
        }
    }

    #[test]
    fn test_assemble_url_and_headers() {
        let prepared = assemble(&message(), &config(), Some("tok")).unwrap();

        assert_eq!(prepared.method, Method::POST);
        assert_eq!(
            prepared.uri.to_string(),
            "https://api.uimkit.chat/v1/accounts/acc%201/conversations/c1?text=hi+there"
        );
        assert_eq!(prepared.headers["authorization"], "Bearer tok");
        assert_eq!(prepared.headers["accept"], JSON);
        assert_eq!(prepared.headers["x-sdk-core-version"], VERSION);
        assert_eq!(prepared.headers["x-sdk-invoke-type"], "normal");
        assert_eq!(prepared.headers["accept-encoding"], "identity");
        assert_eq!(prepared.headers["x-trace"], "t-1");
        assert_eq!(prepared.headers[CONTENT_TYPE], JSON);

        let ua = prepared.headers[USER_AGENT].to_str().unwrap();
        assert!(ua.starts_with(DEFAULT_USER_AGENT.as_str()));
        assert!(ua.ends_with(" Example/1.0 Extra/my-app"));
    }

    #[test]
    fn test_assemble_serializes_json_body() {
        let prepared = assemble(&message(), &config(), None).unwrap();

        assert!(!prepared.headers.contains_key("authorization"));
        let body: serde_json::Value = serde_json::from_slice(&prepared.body).unwrap();
        assert_eq!(body["text"], "hi there");
        assert_eq!(body["account_id"], "acc 1");
    }

    #[test]
    fn test_form_params_win_over_content() {
        let mut request = message();
        request.form_mode = true;
        let prepared = assemble(&request, &config(), None).unwrap();

        assert_eq!(prepared.headers[CONTENT_TYPE], FORM);
        assert_eq!(prepared.body, Bytes::from_static(b"text=hi+there"));
        assert!(prepared.uri.query().is_none());
    }

    struct Overridden;

    impl Serialize for Overridden {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_unit()
        }
    }

    impl Flatten for Overridden {
        fn fields(&self) -> Vec<Field<'_>> {
            Vec::new()
        }
    }

    impl ApiRequest for Overridden {
        fn descriptor(&self) -> RequestDescriptor {
            RequestDescriptor::new("/ping")
                .with_method(Method::GET)
                .with_scheme(Scheme::Http)
                .with_domain("localhost")
                .with_port(8080)
                .with_base_path("/internal")
                .with_content(Bytes::from_static(b"raw"))
                .with_read_timeout(Duration::from_secs(3))
                .with_insecure(true)
        }
    }

    #[test]
    fn test_call_values_win_over_client() {
        let prepared = assemble(&Overridden, &config(), None).unwrap();

        assert_eq!(prepared.method, Method::GET);
        assert_eq!(prepared.uri.to_string(), "http://localhost:8080/internal/ping");
        assert_eq!(prepared.scheme, Scheme::Http);
        assert_eq!(prepared.body, Bytes::from_static(b"raw"));
        assert_eq!(
            prepared.overrides,
            CallOverrides {
                read_timeout: Some(Duration::from_secs(3)),
                connect_timeout: None,
                insecure: Some(true),
            }
        );
    }

    #[test]
    fn test_path_substitution_prefers_longer_names() {
        let mut params = Params::default();
        params.insert(Placement::Path, "id", "1");
        params.insert(Placement::Path, "id_type", "user");
        let url = build_url(Scheme::Https, "h", None, "/:id_type/:id", &params).unwrap();
        assert_eq!(url, "https://h/user/1");
    }

    #[test]
    fn test_append_user_agent_reserves_library_keys() {
        let mut descriptor = RequestDescriptor::new("/");
        descriptor.append_user_agent("core", "9");
        descriptor.append_user_agent("Rust", "9");
        descriptor.append_user_agent("app", "1");
        descriptor.append_user_agent("app", "2");
        assert_eq!(
            descriptor.user_agent_tags(),
            &[("app".to_owned(), "2".to_owned())]
        );
    }

    #[test]
    fn test_add_param_by_tag() {
        let mut descriptor = RequestDescriptor::new("/");
        descriptor.add_param("query", "limit", "10").unwrap();
        descriptor.add_param("header", "X-Custom", "v").unwrap();
        assert_eq!(descriptor.params().query["limit"], "10");
        assert_eq!(descriptor.params().headers["x-custom"], "v");

        let err = descriptor.add_param("cookie", "a", "b").unwrap_err();
        assert_eq!(err.code(), "SDK.UnsupportedParamPosition");
    }
}
