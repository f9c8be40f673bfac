//! Transactional batch of record writes sent in one request.

use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use crate::client::{decode, normalize_query, FilePart, PocketBase, SendOptions};
use crate::error::ClientError;
use crate::models::BatchResult;
use crate::services::{encode_segment, RequestOptions};

pub const BATCH_PATH: &str = "/api/batch";

/// One queued write.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchRequest {
    pub method: Method,
    /// Path relative to the backend root, query included.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    pub files: Vec<FilePart>,
}

/// Collects record writes across collections and submits them together.
#[derive(Clone, Debug)]
pub struct BatchService {
    client: PocketBase,
    requests: Vec<BatchRequest>,
}

impl BatchService {
    pub fn new(client: PocketBase) -> Self {
        Self {
            client,
            requests: Vec::new(),
        }
    }

    /// Queues writes against `collection_id_or_name`.
    pub fn collection(&mut self, collection_id_or_name: &str) -> SubBatch<'_> {
        SubBatch {
            batch: self,
            collection: collection_id_or_name.to_string(),
        }
    }

    pub fn requests(&self) -> &[BatchRequest] {
        &self.requests
    }

    /// Submits every queued write. The backend applies all of them or none.
    pub async fn send(&self, options: &RequestOptions) -> Result<Vec<BatchResult>, ClientError> {
        let mut files = Vec::new();
        let mut requests = Vec::with_capacity(self.requests.len());

        for (index, request) in self.requests.iter().enumerate() {
            requests.push(json!({
                "method": request.method.as_str(),
                "url": request.url,
                "headers": request.headers,
                "body": request.body,
            }));
            for file in &request.files {
                let mut file = file.clone();
                file.field = format!("requests.{index}.{}", file.field);
                files.push(file);
            }
        }

        debug!(
            event = "batch_sent",
            requests = requests.len(),
            files = files.len()
        );
        let body = options.enriched_body([("requests", Value::Array(requests))]);
        let send = options
            .send_options(SendOptions::post())
            .body(body)
            .files(files);
        let value = self.client.send(BATCH_PATH, send).await?;
        Ok(decode(value))
    }

    fn push(&mut self, request: BatchRequest) {
        self.requests.push(request);
    }
}

/// Builder scoped to one collection of a [`BatchService`].
pub struct SubBatch<'a> {
    batch: &'a mut BatchService,
    collection: String,
}

impl SubBatch<'_> {
    pub fn create(&mut self, body: Value, files: Vec<FilePart>, options: &RequestOptions) -> &mut Self {
        let url = self.url(None, options);
        self.queue(Method::POST, url, body, files, options)
    }

    /// Creates the record, or updates it when `body.id` already exists.
    pub fn upsert(&mut self, body: Value, files: Vec<FilePart>, options: &RequestOptions) -> &mut Self {
        let url = self.url(None, options);
        self.queue(Method::PUT, url, body, files, options)
    }

    pub fn update(
        &mut self,
        id: &str,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> &mut Self {
        let url = self.url(Some(id), options);
        self.queue(Method::PATCH, url, body, files, options)
    }

    pub fn delete(&mut self, id: &str, options: &RequestOptions) -> &mut Self {
        let url = self.url(Some(id), options);
        let body = Value::Object(options.body.clone());
        self.queue(Method::DELETE, url, body, Vec::new(), options)
    }

    fn url(&self, id: Option<&str>, options: &RequestOptions) -> String {
        let mut url = format!("/api/collections/{}/records", encode_segment(&self.collection));
        if let Some(id) = id {
            url.push('/');
            url.push_str(&encode_segment(id));
        }
        let query = normalize_query(&options.enriched_query());
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    fn queue(
        &mut self,
        method: Method,
        url: String,
        body: Value,
        files: Vec<FilePart>,
        options: &RequestOptions,
    ) -> &mut Self {
        let body = match body {
            Value::Object(fields) => {
                let mut merged = options.body.clone();
                merged.extend(fields);
                Value::Object(merged)
            }
            Value::Null => Value::Object(options.body.clone()),
            other => other,
        };
        self.batch.push(BatchRequest {
            method,
            url,
            headers: options.headers.clone(),
            body,
            files,
        });
        self
    }
}
