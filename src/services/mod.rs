//! REST services built on the dispatcher.

pub mod batch;
pub mod crud;
pub mod files;
pub mod health;
pub mod record;

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::client::SendOptions;

/// Common optional parameters accepted by service calls.
///
/// Shorthand fields (`expand`, `filter`, `sort`, `fields`) are merged into
/// `query` only when `query` does not already carry the same key. `body`
/// holds extra body fields; named arguments of a call never overwrite them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub expand: Option<String>,
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub fields: Option<String>,
    pub query: Map<String, Value>,
    pub headers: BTreeMap<String, String>,
    pub body: Map<String, Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expand(mut self, expand: impl Into<String>) -> Self {
        self.expand = Some(expand.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    pub(crate) fn enriched_query(&self) -> Map<String, Value> {
        let mut query = self.query.clone();
        for (name, value) in [
            ("expand", &self.expand),
            ("filter", &self.filter),
            ("sort", &self.sort),
            ("fields", &self.fields),
        ] {
            if let Some(value) = value {
                query
                    .entry(name.to_string())
                    .or_insert_with(|| Value::String(value.clone()));
            }
        }
        query
    }

    /// Extra body fields with `fields` added where absent.
    pub(crate) fn enriched_body<I, K>(&self, fields: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut body = self.body.clone();
        for (key, value) in fields {
            body.entry(key.into()).or_insert(value);
        }
        Value::Object(body)
    }

    /// Send options carrying this request's headers and enriched query.
    pub(crate) fn send_options(&self, base: SendOptions) -> SendOptions {
        base.headers(self.headers.clone())
            .extend_query(self.enriched_query())
    }
}

pub(crate) fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
