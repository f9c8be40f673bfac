//! Realtime wire types: event-stream messages, the incremental frame
//! decoder, subscription keys, and the subscription control message.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name of the first message of every session; its `id` is the
/// session's client id.
pub const CONNECT_EVENT: &str = "PB_CONNECT";
/// Default event name of a message without an `event:` field.
pub const DEFAULT_EVENT: &str = "message";

/// One decoded event-stream message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SseMessage {
    /// Last `id:` value; empty when the message carried none.
    pub id: String,
    /// Event name, [`DEFAULT_EVENT`] unless an `event:` line set it.
    pub event: String,
    /// Raw payload of the last `data:` line.
    pub data: String,
    /// Reconnect hint in milliseconds; 0 when absent or unparsable.
    pub retry: i64,
}

impl SseMessage {
    /// Decodes `data` as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }
}

impl Default for SseMessage {
    fn default() -> Self {
        Self {
            id: String::new(),
            event: DEFAULT_EVENT.to_string(),
            data: String::new(),
            retry: 0,
        }
    }
}

fn field_line() -> &'static Regex {
    static FIELD_LINE: OnceLock<Regex> = OnceLock::new();
    FIELD_LINE.get_or_init(|| Regex::new(r"^(\w+)[\s:]+(.*)?$").expect("field-line pattern"))
}

/// Incremental decoder turning arbitrarily chunked bytes into messages.
///
/// Lines end at `\n` (a trailing `\r` is dropped). An empty line completes
/// the current message. Lines that are not `field: value` shaped, comments
/// included, are skipped. A repeated `data` field replaces the previous
/// value.
#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    current: SseMessage,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every message it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        let mut completed = Vec::new();
        for byte in chunk {
            if *byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                if let Some(message) = self.process_line(&line) {
                    completed.push(message);
                }
            } else {
                self.line.push(*byte);
            }
        }
        completed
    }

    /// Flushes an unterminated trailing line at end of stream.
    pub fn finish(&mut self) -> Vec<SseMessage> {
        if self.line.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.line);
        self.process_line(&line).into_iter().collect()
    }

    /// The `retry` value seen so far in the message being assembled.
    pub fn pending_retry(&self) -> i64 {
        self.current.retry
    }

    fn process_line(&mut self, raw: &[u8]) -> Option<SseMessage> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return Some(std::mem::take(&mut self.current));
        }

        let line = String::from_utf8_lossy(raw);
        let captures = field_line().captures(&line)?;
        let field = captures.get(1).map_or("", |m| m.as_str());
        let value = captures.get(2).map_or("", |m| m.as_str());

        match field {
            "id" => self.current.id = value.to_string(),
            "event" => self.current.event = value.to_string(),
            "data" => self.current.data = value.to_string(),
            "retry" => self.current.retry = value.trim().parse().unwrap_or(0),
            _ => {}
        }
        None
    }
}

/// Options qualifying a subscription. Distinct option sets on the same topic
/// are tracked as distinct subscriptions.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubscribeOptions {
    pub expand: Option<String>,
    pub filter: Option<String>,
    pub fields: Option<String>,
    pub query: Map<String, Value>,
    pub headers: BTreeMap<String, String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relations to expand in pushed records.
    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    /// Only push records matching this filter expression.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Comma-separated fields to keep in pushed records.
    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    /// Adds an arbitrary query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Adds a header the backend applies when authorizing pushes.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Builds the key a subscription is multiplexed under.
///
/// Without options the key is the bare topic. Otherwise the `{query,
/// headers}` object is serialized as JSON and appended as a form-encoded
/// `options` parameter. Object keys serialize in sorted order, so equivalent
/// option sets always produce the same key.
pub fn subscription_key(topic: &str, options: &SubscribeOptions) -> String {
    let mut query = options.query.clone();
    for (name, value) in [
        ("expand", &options.expand),
        ("filter", &options.filter),
        ("fields", &options.fields),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.trim().is_empty()) {
            query
                .entry(name.to_string())
                .or_insert_with(|| Value::String(value.to_string()));
        }
    }

    let mut serialized = Map::new();
    if !query.is_empty() {
        serialized.insert("query".to_string(), Value::Object(query));
    }
    if !options.headers.is_empty() {
        let headers = options
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        serialized.insert("headers".to_string(), Value::Object(headers));
    }

    if serialized.is_empty() {
        return topic.to_string();
    }

    let json = Value::Object(serialized).to_string();
    let encoded: String = url::form_urlencoded::byte_serialize(json.as_bytes()).collect();
    let separator = if topic.contains('?') { '&' } else { '?' };
    format!("{topic}{separator}options={encoded}")
}

/// Control message telling the backend which keys to push on a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionsRequest {
    pub client_id: String,
    pub subscriptions: Vec<String>,
}
