//! HTTP request dispatch and the [`PocketBase`] entry point.
//!
//! Every REST call goes through [`Dispatcher::send`]: one round trip with the
//! language and auth headers attached, non-success statuses classified into
//! [`ClientError`], and success bodies parsed leniently as JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::auth_store::AuthStore;
use crate::error::{parse_error_body, ClientError};
use crate::realtime::service::{RealtimeOptions, RealtimeService};
use crate::services::batch::BatchService;
use crate::services::files::FileService;
use crate::services::health::HealthService;
use crate::services::record::RecordService;

/// Multipart field carrying the JSON body next to file parts.
pub const JSON_PAYLOAD_FIELD: &str = "@jsonPayload";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientDefaults;

impl ClientDefaults {
    pub const LANG: &'static str = "en-US";
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Sent as `Accept-Language` unless a request overrides it.
    pub lang: String,
    /// Limit on establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Applies to one-shot requests only; the realtime stream has no total
    /// timeout.
    pub request_timeout: Option<Duration>,
    /// Reconnect policy and transport strategy of the realtime session.
    pub realtime: RealtimeOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            lang: ClientDefaults::LANG.to_string(),
            connect_timeout: ClientDefaults::CONNECT_TIMEOUT,
            request_timeout: Some(ClientDefaults::REQUEST_TIMEOUT),
            realtime: RealtimeOptions::default(),
        }
    }
}

/// A file uploaded as one multipart section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilePart {
    /// Form field the file is attached to.
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Content type; the part is sent untyped when `None`.
    pub mime: Option<String>,
}

impl FilePart {
    /// Untyped file part for `field`.
    pub fn new(field: impl Into<String>, file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            bytes,
            mime: None,
        }
    }

    /// Sets the part's content type. An unparsable value fails the request.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    fn into_part(self) -> Result<Part, reqwest::Error> {
        let part = Part::bytes(self.bytes).file_name(self.file_name);
        match self.mime {
            Some(mime) => part.mime_str(&mime),
            None => Ok(part),
        }
    }
}

/// Per-request settings for [`Dispatcher::send`].
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    /// Null values are skipped when the query string is built.
    pub query: Map<String, Value>,
    pub body: Option<Value>,
    pub files: Vec<FilePart>,
}

impl SendOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Shorthand for `SendOptions::new(Method::GET)`; the other verb
    /// constructors follow the same pattern.
    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post() -> Self {
        Self::new(Method::POST)
    }

    pub fn patch() -> Self {
        Self::new(Method::PATCH)
    }

    pub fn put() -> Self {
        Self::new(Method::PUT)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    /// Sets one header, replacing an earlier value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Merges `headers` into the existing ones; later names win.
    pub fn headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Sets one query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Merges `query` into the existing parameters; later keys win.
    pub fn extend_query(mut self, query: Map<String, Value>) -> Self {
        self.query.extend(query);
        self
    }

    /// JSON body, or the `@jsonPayload` section when files are attached.
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attaches a file; any file switches the request to multipart.
    pub fn file(mut self, file: FilePart) -> Self {
        self.files.push(file);
        self
    }

    /// Attaches several files.
    pub fn files(mut self, files: Vec<FilePart>) -> Self {
        self.files.extend(files);
        self
    }
}

/// Builds URLs and performs single HTTP round trips against one backend.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    base_url: String,
    lang: String,
    request_timeout: Option<Duration>,
    http: Client,
    auth_store: AuthStore,
}

impl Dispatcher {
    pub fn new(
        base_url: impl Into<String>,
        options: &ClientOptions,
        auth_store: AuthStore,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into().trim().to_string();
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|source| ClientError::Transport {
                url: base_url.clone(),
                source,
            })?;

        Ok(Self {
            base_url,
            lang: options.lang.clone(),
            request_timeout: options.request_timeout,
            http,
            auth_store,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth_store(&self) -> &AuthStore {
        &self.auth_store
    }

    /// Client shared with the realtime transport.
    pub(crate) fn http(&self) -> Client {
        self.http.clone()
    }

    /// Joins the base URL with `path` and appends the normalized query.
    pub fn build_url(&self, path: &str, query: Option<&Map<String, Value>>) -> String {
        let mut url = self.base_url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        url.push_str(path.strip_prefix('/').unwrap_or(path));

        let query = query.map(normalize_query).unwrap_or_default();
        if !query.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query);
        }
        url
    }

    /// Performs one request and returns the parsed success body.
    ///
    /// Empty or unparsable success bodies yield `Value::Null`.
    pub async fn send(&self, path: &str, options: SendOptions) -> Result<Value, ClientError> {
        let SendOptions {
            method,
            mut headers,
            query,
            body,
            files,
        } = options;
        let url = self.build_url(path, Some(&query));

        insert_header_if_absent(&mut headers, "Accept-Language", &self.lang);
        if self.auth_store.is_valid() {
            insert_header_if_absent(&mut headers, "Authorization", &self.auth_store.token());
        }

        let mut request = self.http.request(method.clone(), &url);
        if let Some(timeout) = self.request_timeout {
            request = request.timeout(timeout);
        }
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }

        if files.is_empty() {
            if let Some(body) = &body {
                request = request.json(body);
            }
        } else {
            let mut form = Form::new();
            if let Some(body) = &body {
                form = form.text(JSON_PAYLOAD_FIELD, body.to_string());
            }
            for file in files {
                let field = file.field.clone();
                let part = file.into_part().map_err(|source| ClientError::Transport {
                    url: url.clone(),
                    source,
                })?;
                form = form.part(field, part);
            }
            request = request.multipart(form);
        }

        debug!(event = "request_sent", method = %method, url = %url);
        let response = request.send().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            debug!(event = "request_failed", url = %url, status = status.as_u16());
            return Err(ClientError::Status {
                url,
                status,
                response: parse_error_body(&text),
                body: text,
            });
        }

        Ok(parse_success_body(&url, &text))
    }
}

fn insert_header_if_absent(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    if !headers.keys().any(|key| key.eq_ignore_ascii_case(name)) {
        headers.insert(name.to_string(), value.to_string());
    }
}

fn parse_success_body(url: &str, text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|err| {
        warn!(event = "response_body_unparsable", url = %url, error = %err);
        Value::Null
    })
}

/// Serializes query parameters. Nulls are skipped, strings are used raw,
/// arrays repeat the key, and everything else uses its JSON text.
pub(crate) fn normalize_query(query: &Map<String, Value>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in query {
        match value {
            Value::Null => {}
            Value::Array(items) => {
                for item in items.iter().filter(|item| !item.is_null()) {
                    serializer.append_pair(key, &query_value(item));
                }
            }
            other => {
                serializer.append_pair(key, &query_value(other));
            }
        }
    }
    serializer.finish()
}

fn query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Converts a response body into `T`, falling back to `T::default()` when the
/// body does not have the expected shape.
pub(crate) fn decode<T>(value: Value) -> T
where
    T: DeserializeOwned + Default,
{
    if value.is_null() {
        return T::default();
    }
    serde_json::from_value(value).unwrap_or_else(|err| {
        warn!(event = "response_shape_mismatch", error = %err);
        T::default()
    })
}

/// Value substituted into a `{:name}` filter placeholder.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterParam {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    DateTime(DateTime<Utc>),
    Json(Value),
}

impl FilterParam {
    fn render(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => format!("'{}'", s.replace('\'', "\\'")),
            Self::DateTime(dt) => format!("'{}'", dt.format("%Y-%m-%d %H:%M:%S%.3fZ")),
            Self::Json(value) => format!("'{}'", value.to_string().replace('\'', "\\'")),
        }
    }
}

impl From<&str> for FilterParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FilterParam {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for FilterParam {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FilterParam {
    fn from(value: i64) -> Self {
        Self::Number(value.into())
    }
}

impl From<i32> for FilterParam {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<f64> for FilterParam {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<DateTime<Utc>> for FilterParam {
    fn from(value: DateTime<Utc>) -> Self {
        Self::DateTime(value)
    }
}

impl From<Value> for FilterParam {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            other => Self::Json(other),
        }
    }
}

/// Replaces every `{:name}` placeholder in `expr` with its escaped value.
pub fn filter<K, I>(expr: &str, params: I) -> String
where
    K: AsRef<str>,
    I: IntoIterator<Item = (K, FilterParam)>,
{
    params
        .into_iter()
        .fold(expr.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{:{}}}", name.as_ref()), &value.render())
        })
}

/// Client for one backend.
#[derive(Clone, Debug)]
pub struct PocketBase {
    dispatcher: Dispatcher,
    realtime: RealtimeService,
    options: ClientOptions,
}

impl PocketBase {
    /// Creates a client with default options and an in-memory auth store.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, ClientOptions::default(), AuthStore::new())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: ClientOptions,
        auth_store: AuthStore,
    ) -> Result<Self, ClientError> {
        let dispatcher = Dispatcher::new(base_url, &options, auth_store)?;
        let realtime = RealtimeService::new(dispatcher.clone(), options.realtime.clone());
        Ok(Self {
            dispatcher,
            realtime,
            options,
        })
    }

    pub fn base_url(&self) -> &str {
        self.dispatcher.base_url()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn auth_store(&self) -> &AuthStore {
        self.dispatcher.auth_store()
    }

    pub fn realtime(&self) -> &RealtimeService {
        &self.realtime
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Record service bound to one collection.
    pub fn collection(&self, id_or_name: impl Into<String>) -> RecordService {
        RecordService::new(self.clone(), id_or_name)
    }

    /// Starts a new transactional batch.
    pub fn create_batch(&self) -> BatchService {
        BatchService::new(self.clone())
    }

    pub fn health(&self) -> HealthService {
        HealthService::new(self.clone())
    }

    pub fn files(&self) -> FileService {
        FileService::new(self.clone())
    }

    pub fn build_url(&self, path: &str, query: Option<&Map<String, Value>>) -> String {
        self.dispatcher.build_url(path, query)
    }

    pub async fn send(&self, path: &str, options: SendOptions) -> Result<Value, ClientError> {
        self.dispatcher.send(path, options).await
    }

    /// See [`filter`].
    pub fn filter<K, I>(expr: &str, params: I) -> String
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, FilterParam)>,
    {
        filter(expr, params)
    }
}
